use std::path::Path;

/// Termux exposes no desktop player; playback there goes through Android
/// activity intents instead of spawning mpv.
pub fn is_running_in_termux() -> bool {
    std::env::var_os("TERMUX_VERSION").is_some() || Path::new("/data/data/com.termux").exists()
}
