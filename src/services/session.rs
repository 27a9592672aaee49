//! Session persistence.
//!
//! The interactive layer hands over its menu-navigation history as opaque
//! frames; this service snapshots them on graceful exit and on crash so a
//! later run can resume where the user left off. Sessions are immutable
//! snapshots; there is no merging.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SessionsConfig;
use crate::utils::fs::atomic_write;

/// One frame of menu state, opaque to the engine.
pub type SessionFrame = serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_from_crash: bool,
    #[serde(default)]
    pub history: Vec<SessionFrame>,
}

impl Session {
    fn new(name: String, history: Vec<SessionFrame>, is_from_crash: bool) -> Self {
        Self {
            name,
            created_at: Utc::now(),
            is_from_crash,
            history,
        }
    }
}

pub struct SessionsService {
    dir: PathBuf,
}

impl SessionsService {
    pub fn new(config: &SessionsConfig) -> Self {
        let service = Self {
            dir: config.dir.clone(),
        };
        if let Err(err) = std::fs::create_dir_all(&service.dir) {
            warn!(error = %err, "failed to create sessions directory");
        }
        service
    }

    fn timestamped_name() -> String {
        format!("session_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"))
    }

    /// Persist the history under "default" (the resume target) or a fresh
    /// timestamped name.
    pub fn save_session(&self, history: Vec<SessionFrame>, default: bool) -> Result<()> {
        let name = if default {
            "default".to_string()
        } else {
            Self::timestamped_name()
        };
        self.write(Session::new(name, history, false))
    }

    /// Crash snapshots live under a distinct name so a resume can tell the
    /// difference.
    pub fn create_crash_backup(&self, history: Vec<SessionFrame>) -> Result<()> {
        self.write(Session::new("crash".to_string(), history, true))
    }

    pub fn get_session_history(&self, name: &str) -> Option<Vec<SessionFrame>> {
        self.read(name).map(|session| session.history)
    }

    pub fn get_default_session_history(&self) -> Option<Vec<SessionFrame>> {
        self.get_session_history("default")
    }

    /// Latest timestamp-named session, decoded from the filenames.
    pub fn get_most_recent_session_history(&self) -> Option<Vec<SessionFrame>> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let mut best: Option<(NaiveDateTime, String)> = None;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(raw) = stem.strip_prefix("session_") else {
                continue;
            };
            match NaiveDateTime::parse_from_str(raw, "%Y%m%d_%H%M%S_%6f") {
                Ok(ts) => {
                    if best.as_ref().map(|(t, _)| ts > *t).unwrap_or(true) {
                        best = Some((ts, stem.to_string()));
                    }
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "sessions dir is impure");
                }
            }
        }

        best.and_then(|(_, name)| self.get_session_history(&name))
    }

    fn write(&self, session: Session) -> Result<()> {
        let path = self.dir.join(format!("{}.json", session.name));
        atomic_write(&path, &serde_json::to_vec(&session)?)?;
        debug!(name = %session.name, frames = session.history.len(), "session saved");
        Ok(())
    }

    fn read(&self, name: &str) -> Option<Session> {
        let path = self.dir.join(format!("{name}.json"));
        if !path.exists() {
            warn!(path = %path.display(), "session file not found");
            return None;
        }
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Session>(&contents) {
            Ok(session) => {
                debug!(name, frames = session.history.len(), "session loaded");
                Some(session)
            }
            Err(err) => {
                warn!(name, error = %err, "malformed session file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> SessionsService {
        SessionsService::new(&SessionsConfig {
            dir: dir.path().to_path_buf(),
        })
    }

    #[test]
    fn default_session_round_trips() {
        let dir = TempDir::new().unwrap();
        let sessions = service(&dir);

        let history = vec![json!({"menu": "results", "page": 2})];
        sessions.save_session(history.clone(), true).unwrap();
        assert_eq!(sessions.get_default_session_history(), Some(history));
    }

    #[test]
    fn crash_backup_uses_distinct_name() {
        let dir = TempDir::new().unwrap();
        let sessions = service(&dir);

        sessions.save_session(vec![json!({"menu": "a"})], true).unwrap();
        sessions
            .create_crash_backup(vec![json!({"menu": "b"})])
            .unwrap();

        assert!(dir.path().join("default.json").exists());
        assert!(dir.path().join("crash.json").exists());
        assert_ne!(
            sessions.get_session_history("crash"),
            sessions.get_session_history("default")
        );
    }

    #[test]
    fn most_recent_session_picks_latest_timestamp() {
        let dir = TempDir::new().unwrap();
        let sessions = service(&dir);

        for (name, marker) in [
            ("session_20240101_000000_000000", "old"),
            ("session_20250601_120000_000000", "new"),
        ] {
            let session = Session {
                name: name.to_string(),
                created_at: Utc::now(),
                is_from_crash: false,
                history: vec![json!({ "marker": marker })],
            };
            std::fs::write(
                dir.path().join(format!("{name}.json")),
                serde_json::to_vec(&session).unwrap(),
            )
            .unwrap();
        }

        let history = sessions.get_most_recent_session_history().unwrap();
        assert_eq!(history[0]["marker"], "new");
    }
}
