use chrono::{SecondsFormat, Utc};

/// UTC timestamp with fixed microsecond width, so text ordering matches time ordering.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
