use std::path::PathBuf;

pub const APP_NAME: &str = "torii";

pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64; rv:131.0) Gecko/20100101 Firefox/131.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (Version/17.6 Safari/605.1.15)",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
];

pub fn random_user_agent() -> &'static str {
    use rand::Rng;
    USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())]
}

/// Application data directory (registry, sessions, auth, logs live under it).
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn registry_dir() -> PathBuf {
    app_data_dir().join("registry")
}

pub fn sessions_dir() -> PathBuf {
    app_data_dir().join("sessions")
}

pub fn auth_dir() -> PathBuf {
    app_data_dir().join("auth")
}

pub fn logs_dir() -> PathBuf {
    app_data_dir().join("logs")
}

/// Default download destination. Respects the platform video directory
/// (XDG_VIDEOS_DIR on Unix) before falling back to the data directory.
pub fn default_downloads_dir() -> PathBuf {
    dirs::video_dir()
        .map(|d| d.join(APP_NAME))
        .unwrap_or_else(|| app_data_dir().join("downloads"))
}
