//! Utility functions for the ranked engine

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Maximum length of a custom room code
pub const MAX_ROOM_CODE_LEN: usize = 12;

/// Generate a new unique match ID
pub fn generate_match_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique dispute ID
pub fn generate_dispute_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Absolute difference scaled by `normalizer` and clamped to [0, 1]
pub fn normalized_difference(a: f64, b: f64, normalizer: f64) -> f64 {
    if normalizer <= 0.0 {
        return if a == b { 0.0 } else { 1.0 };
    }
    ((a - b).abs() / normalizer).clamp(0.0, 1.0)
}

/// Trim and upper-case a room code, rejecting anything that is not 1-12 ASCII alphanumerics
pub fn normalize_room_code(code: &str) -> Option<String> {
    let trimmed = code.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_ROOM_CODE_LEN
        || !trimmed.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}
