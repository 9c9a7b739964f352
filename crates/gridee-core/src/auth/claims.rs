//! Unverified reads of JWT payload claims.
//!
//! The signature is never checked here; the server does that. The client
//! only peeks at `exp` to know when to stop sending the token.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde_json::Value as JsonValue;

/// Expiry instant of a JWT-shaped token, in milliseconds since the epoch.
///
/// Returns `None` when the token has fewer than two segments, the payload is
/// not base64url JSON, or `exp` is missing, non-numeric or not positive.
/// Expiries beyond the representable range saturate at `i64::MAX`.
pub fn decode_expiry_claim(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE.decode(restore_padding(payload)).ok()?;
    let claims: JsonValue = serde_json::from_slice(&bytes).ok()?;

    let exp = claims.as_object()?.get("exp")?;
    exp_to_millis(exp)
}

/// Seconds to milliseconds, saturating at `i64::MAX` for absurdly far
/// expiries. Fractional seconds keep their millisecond part.
fn exp_to_millis(exp: &JsonValue) -> Option<i64> {
    if let Some(seconds) = exp.as_i64() {
        return (seconds > 0).then(|| seconds.saturating_mul(1000));
    }
    if let Some(seconds) = exp.as_u64() {
        return Some(i64::try_from(seconds).unwrap_or(i64::MAX).saturating_mul(1000));
    }
    let seconds = exp.as_f64().filter(|f| f.is_finite())?;
    if seconds <= 0.0 {
        return None;
    }
    // Float-to-int `as` saturates; keep sub-millisecond claims positive
    Some(((seconds * 1000.0) as i64).max(1))
}

/// Re-append the `=` padding that base64url tokens usually drop.
fn restore_padding(segment: &str) -> String {
    match segment.len() % 4 {
        2 => format!("{}==", segment),
        3 => format!("{}=", segment),
        _ => segment.to_string(),
    }
}
