//! Human-readable formatting for log lines.
//!
//! Byte sizes go through `humansize` at the call sites; durations have no
//! equivalent there, so we keep a small formatter of our own.

use std::time::Duration;

/// Format an elapsed duration the way it reads best in a terminal:
/// `100ms`, `1.23s`, `2m30.50s`.
pub fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    if seconds < 1.0 {
        format!("{:.0}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{seconds:.2}s")
    } else {
        let minutes = (seconds / 60.0).floor() as u64;
        format!("{minutes}m{:.2}s", seconds % 60.0)
    }
}
