#[tokio::main]
async fn main() {
    if let Err(err) = torii::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
