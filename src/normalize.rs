use std::sync::LazyLock;

use chrono::{FixedOffset, TimeZone, Utc};
use regex::Regex;

static DATE_BR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-3]?\d)/([0-1]?\d)/(\d{4})$").unwrap());
static DATETIME_BR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-3]?\d)/([0-1]?\d)/(\d{4})\s+([0-2]?\d):([0-5]\d)$").unwrap());
static CONTROL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\x00-\x1F\x7F]").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Collapse control characters and runs of whitespace to single spaces.
pub fn normalize_text(input: &str) -> String {
    let cleaned = CONTROL_RE.replace_all(input, " ");
    SPACES_RE.replace_all(&cleaned, " ").trim().to_string()
}

/// `D/M/YYYY` → `YYYY-MM-DD`. Regex-only; no calendar validation, so
/// 31/02/2025 passes through as-is.
pub fn parse_date_br(input: &str) -> Option<String> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }
    let caps = DATE_BR_RE.captures(text)?;
    Some(format!(
        "{}-{:0>2}-{:0>2}",
        &caps[3], &caps[2], &caps[1]
    ))
}

/// `D/M/YYYY HH:MM` at fixed UTC-03:00 (no DST) → ISO-8601 UTC instant.
/// Calendar-invalid inputs yield `None`.
pub fn parse_datetime_br(input: &str) -> Option<String> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }
    let caps = DATETIME_BR_RE.captures(text)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    let hour: u32 = caps[4].parse().ok()?;
    let minute: u32 = caps[5].parse().ok()?;

    let offset = FixedOffset::west_opt(3 * 3600)?;
    let local = offset
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()?;
    Some(
        local
            .with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string(),
    )
}
