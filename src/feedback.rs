//! User-visible message sink.
//!
//! Everything the user is meant to read goes through here rather than the
//! log stream; fatal paths call [`Feedback::error`] before exiting.

use std::time::Instant;

use tracing::debug;

#[derive(Clone, Copy)]
pub struct Feedback {
    icons: bool,
}

impl Feedback {
    pub fn new(icons: bool) -> Self {
        Self { icons }
    }

    fn prefix(&self, icon: &str, fallback: &str) -> String {
        if self.icons {
            format!("{icon} ")
        } else {
            fallback.to_string()
        }
    }

    pub fn info(&self, message: &str) {
        println!("{}{message}", self.prefix("ℹ️", ""));
    }

    pub fn success(&self, message: &str) {
        println!("{}{message}", self.prefix("✅", "✓ "));
    }

    pub fn warning(&self, message: &str) {
        eprintln!("{}{message}", self.prefix("⚠️", "warning: "));
    }

    pub fn error(&self, message: &str) {
        eprintln!("{}{message}", self.prefix("❌", "error: "));
    }

    /// Progress context for long operations; reports the elapsed time when
    /// dropped.
    pub fn progress(&self, message: &str) -> ProgressGuard {
        println!("{}{message}...", self.prefix("⏳", ""));
        ProgressGuard {
            started: Instant::now(),
            message: message.to_string(),
        }
    }
}

pub struct ProgressGuard {
    started: Instant,
    message: String,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        debug!(
            task = %self.message,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "progress context finished"
        );
    }
}
