use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Most service code uses `anyhow::Result` and only reaches for these
/// variants at the boundaries where callers dispatch on the failure class
/// (registry version checks, IPC setup, player launch).
#[derive(Debug, Error)]
pub enum ToriiError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(
        "Incompatible registry version {found} (supported: {supported}). \
         Migrate the registry before continuing"
    )]
    RegistryVersion { found: String, supported: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Player error: {0}")]
    Player(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Malformed JSON in {path}: {source}")]
    MalformedDocument {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
