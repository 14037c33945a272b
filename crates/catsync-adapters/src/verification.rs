//! Webhook signature schemes.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret).ok()
}

/// Hex HMAC-SHA256 of `body`, formatted as `sha256=<hex>`.
pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> String {
    let Some(mut mac) = mac(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `sha256=<hex>` (or bare hex) signature header.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], header_value: &str) -> bool {
    let hex_part = header_value.trim();
    let hex_part = hex_part.strip_prefix("sha256=").unwrap_or(hex_part);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let Some(mut mac) = mac(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn standard_webhooks_key(secret: &str) -> Vec<u8> {
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap_or_else(|_| secret.as_bytes().to_vec())
}

/// `v1,<base64>` signature over `<msg-id>.<timestamp>.<body>`.
pub fn sign_standard_webhooks(secret: &str, body: &[u8], msg_id: &str, timestamp: &str) -> String {
    let Some(mut mac) = mac(&standard_webhooks_key(secret)) else {
        return String::new();
    };
    mac.update(format!("{msg_id}.{timestamp}.").as_bytes());
    mac.update(body);
    let sig = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    format!("v1,{sig}")
}

/// The header may carry several space-separated signatures; any match passes.
pub fn verify_standard_webhooks(
    secret: &str,
    body: &[u8],
    msg_id: &str,
    timestamp: &str,
    header_value: &str,
) -> bool {
    let key = standard_webhooks_key(secret);
    header_value.split_whitespace().any(|candidate| {
        let Some(encoded) = candidate.strip_prefix("v1,") else {
            return false;
        };
        let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            return false;
        };
        let Some(mut mac) = mac(&key) else {
            return false;
        };
        mac.update(format!("{msg_id}.{timestamp}.").as_bytes());
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    })
}

/// Default skew allowed between `webhook-timestamp` and the local clock.
pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("timestamp {0:?} is not unix seconds")]
    Unparsable(String),
    #[error("timestamp is {skew}s away from now, more than the allowed {tolerance}s")]
    OutsideTolerance { skew: u64, tolerance: u64 },
}

/// Rejects `webhook-timestamp` values too far from `now` in either direction,
/// so captured deliveries cannot be replayed later.
pub fn check_timestamp(timestamp: &str, now: DateTime<Utc>, tolerance_secs: u64) -> Result<(), TimestampError> {
    let sent: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| TimestampError::Unparsable(timestamp.to_string()))?;
    let skew = now.timestamp().abs_diff(sent);
    if skew > tolerance_secs {
        return Err(TimestampError::OutsideTolerance {
            skew,
            tolerance: tolerance_secs,
        });
    }
    Ok(())
}

/// Constant-time comparison of a shared secret header.
pub fn verify_shared_secret(secret: &str, header_value: &str) -> bool {
    let (a, b) = (secret.as_bytes(), header_value.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_accepts_own_signature_and_rejects_tampering() {
        let sig = sign_hmac_sha256("s3cret", b"{\"id\":1}");
        assert!(sig.starts_with("sha256="));
        assert!(verify_hmac_sha256("s3cret", b"{\"id\":1}", &sig));
        assert!(verify_hmac_sha256("s3cret", b"{\"id\":1}", sig.trim_start_matches("sha256=")));
        assert!(!verify_hmac_sha256("s3cret", b"{\"id\":2}", &sig));
        assert!(!verify_hmac_sha256("other", b"{\"id\":1}", &sig));
        assert!(!verify_hmac_sha256("s3cret", b"{}", "sha256=not-hex"));
    }

    #[test]
    fn standard_webhooks_round_trip_with_prefixed_secret() {
        let secret = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";
        let sig = sign_standard_webhooks(secret, b"payload", "msg_1", "1700000000");
        let header = format!("v1,bogus {sig}");
        assert!(verify_standard_webhooks(secret, b"payload", "msg_1", "1700000000", &header));
        assert!(!verify_standard_webhooks(secret, b"payload", "msg_2", "1700000000", &header));
    }

    #[test]
    fn timestamps_outside_the_window_are_rejected() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).expect("time");
        assert_eq!(check_timestamp("1700000000", now, 300), Ok(()));
        assert_eq!(check_timestamp("1699999700", now, 300), Ok(()));
        assert_eq!(check_timestamp(" 1700000290 ", now, 300), Ok(()));
        assert_eq!(
            check_timestamp("1699999699", now, 300),
            Err(TimestampError::OutsideTolerance { skew: 301, tolerance: 300 })
        );
        assert!(matches!(
            check_timestamp("1700003600", now, 300),
            Err(TimestampError::OutsideTolerance { .. })
        ));
        assert_eq!(
            check_timestamp("yesterday", now, 300),
            Err(TimestampError::Unparsable("yesterday".into()))
        );
        assert!(matches!(check_timestamp("", now, 300), Err(TimestampError::Unparsable(_))));
    }

    #[test]
    fn shared_secret_compares_exactly() {
        assert!(verify_shared_secret("token", "token"));
        assert!(!verify_shared_secret("token", "tokem"));
        assert!(!verify_shared_secret("token", "token2"));
    }
}
