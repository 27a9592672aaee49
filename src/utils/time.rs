use std::cmp::Ordering;

/// Convert an "HH:MM:SS" string to seconds. Malformed input yields 0.
pub fn time_to_seconds(time_str: &str) -> u64 {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return 0;
    }
    match (
        parts[0].parse::<u64>(),
        parts[1].parse::<u64>(),
        parts[2].parse::<u64>(),
    ) {
        (Ok(h), Ok(m), Ok(s)) => h * 3600 + m * 60 + s,
        _ => 0,
    }
}

/// Format seconds as "HH:MM:SS".
pub fn format_time(total_secs: f64) -> String {
    let total = total_secs.max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Watch completion as a percentage, capped at 100. Zero duration is 0%.
pub fn completion_percentage(last_watch_time: &str, total_duration: &str) -> f64 {
    let watched = time_to_seconds(last_watch_time) as f64;
    let total = time_to_seconds(total_duration) as f64;
    if total == 0.0 {
        return 0.0;
    }
    (watched / total * 100.0).min(100.0)
}

/// Order two episode identifiers. Numeric when both parse as floats (so
/// "7.5" sits between "7" and "8"), lexicographic otherwise.
pub fn compare_episodes(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Episode sort key for ordering lists of episode identifiers.
pub fn episode_sort_key(ep: &str) -> f64 {
    ep.parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmmss_round_trips() {
        assert_eq!(time_to_seconds("01:02:03"), 3723);
        assert_eq!(format_time(3723.0), "01:02:03");
        assert_eq!(time_to_seconds("garbage"), 0);
        assert_eq!(time_to_seconds("1:2"), 0);
    }

    #[test]
    fn completion_caps_at_hundred() {
        assert_eq!(completion_percentage("00:12:00", "00:24:00"), 50.0);
        assert_eq!(completion_percentage("00:30:00", "00:24:00"), 100.0);
        assert_eq!(completion_percentage("00:30:00", "00:00:00"), 0.0);
    }

    #[test]
    fn episode_compare_is_numeric_when_possible() {
        assert_eq!(compare_episodes("7.5", "8"), Ordering::Less);
        assert_eq!(compare_episodes("10", "9"), Ordering::Greater);
        // Falls back to string compare when either side is not a number.
        assert_eq!(compare_episodes("OVA", "Special"), Ordering::Less);
    }
}
