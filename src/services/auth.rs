//! Credential persistence for catalog authentication.
//!
//! One JSON file per catalog api under `auth/`. Tokens never reach the logs.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::media::UserProfile;
use crate::utils::fs::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthProfile {
    pub user_profile: UserProfile,
    pub token: String,
}

pub struct AuthService {
    path: PathBuf,
}

impl AuthService {
    pub fn new(media_api: &str) -> Self {
        Self {
            path: crate::constants::auth_dir().join(format!("{media_api}.json")),
        }
    }

    pub fn with_dir(media_api: &str, dir: PathBuf) -> Self {
        Self {
            path: dir.join(format!("{media_api}.json")),
        }
    }

    pub fn get_auth(&self) -> Option<AuthProfile> {
        if !self.path.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(error = %err, "failed to read auth file");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(error = %err, "malformed auth file");
                None
            }
        }
    }

    pub fn save_auth(&self, profile: &AuthProfile) -> Result<()> {
        atomic_write(&self.path, &serde_json::to_vec_pretty(profile)?)?;
        debug!(user = %profile.user_profile.name, "credentials saved");
        Ok(())
    }

    /// Called when the catalog rejects the stored token.
    pub fn clear_auth(&self) {
        if self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(error = %err, "failed to clear credentials");
            } else {
                debug!("credentials cleared");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn profile() -> AuthProfile {
        AuthProfile {
            user_profile: UserProfile {
                id: 1,
                name: "tester".into(),
                avatar_url: None,
                banner_url: None,
            },
            token: "secret-token".into(),
        }
    }

    #[test]
    fn save_load_clear() {
        let dir = TempDir::new().unwrap();
        let service = AuthService::with_dir("anilist", dir.path().to_path_buf());

        assert!(service.get_auth().is_none());
        service.save_auth(&profile()).unwrap();
        assert_eq!(service.get_auth(), Some(profile()));

        service.clear_auth();
        assert!(service.get_auth().is_none());
    }
}
