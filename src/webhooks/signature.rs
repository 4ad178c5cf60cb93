//! Webhook signature verification.
//!
//! The payment provider signs every delivery with a shared secret: the
//! `Stripe-Signature` header carries `t=<unix-ts>,v1=<hex-hmac>` pairs where
//! the HMAC-SHA256 is computed over `"{t}.{raw body}"`. Verification runs
//! over the exact raw bytes received, before any JSON parsing.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingHeader,
    #[error("signature header malformed")]
    Malformed,
    #[error("signature timestamp outside tolerance ({age_secs}s old)")]
    StaleTimestamp { age_secs: u64 },
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies the signature header against the raw request body.
///
/// The timestamp check bounds replay of captured deliveries; `tolerance_secs`
/// of 0 disables it.
pub fn verify(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .ok_or(SignatureError::MissingHeader)?
        .to_str()
        .map_err(|_| SignatureError::Malformed)?;

    let (timestamp, candidate) = parse_header(header)?;

    if tolerance_secs > 0 {
        let now = chrono::Utc::now().timestamp();
        let age = (now - timestamp).unsigned_abs();
        if age > tolerance_secs {
            return Err(SignatureError::StaleTimestamp { age_secs: age });
        }
    }

    let expected = compute_signature(secret, timestamp, payload);
    if constant_time_eq(&expected, candidate) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Computes the hex HMAC over `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Builds a full signature header value for a payload. Used by the test
/// suite and by local tooling that replays captured events.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)
    )
}

fn parse_header(header: &str) -> Result<(i64, &str), SignatureError> {
    let mut ts = "";
    let mut v1 = "";
    for part in header.split(',') {
        let mut it = part.trim().split('=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => ts = val,
            (Some("v1"), Some(val)) => v1 = val,
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let timestamp = ts.parse::<i64>().map_err(|_| SignatureError::Malformed)?;
    Ok((timestamp, v1))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "whsec_unit_test_secret";

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let now = chrono::Utc::now().timestamp();
        let headers = headers_with(&signature_header(SECRET, now, body));

        assert_eq!(verify(&headers, body, SECRET, 300), Ok(()));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let body = br#"{"id":"evt_1","amount_total":1000}"#;
        let now = chrono::Utc::now().timestamp();
        let headers = headers_with(&signature_header(SECRET, now, body));

        let mut tampered = body.to_vec();
        // flip one byte of the signed payload
        tampered[20] ^= 0x01;

        assert_eq!(
            verify(&headers, &tampered, SECRET, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let now = chrono::Utc::now().timestamp();
        let headers = headers_with(&signature_header("whsec_other", now, body));

        assert_eq!(
            verify(&headers, body, SECRET, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn missing_header_is_rejected() {
        let headers = HeaderMap::new();
        assert_eq!(
            verify(&headers, b"body", SECRET, 300),
            Err(SignatureError::MissingHeader)
        );
    }

    #[test]
    fn malformed_header_is_rejected() {
        for bad in ["", "t=abc,v1=", "v1=deadbeef", "t=123", "nonsense"] {
            let headers = headers_with(bad);
            assert_eq!(
                verify(&headers, b"body", SECRET, 300),
                Err(SignatureError::Malformed),
                "header {:?} should be malformed",
                bad
            );
        }
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = b"body";
        let old = chrono::Utc::now().timestamp() - 3600;
        let headers = headers_with(&signature_header(SECRET, old, body));

        assert!(matches!(
            verify(&headers, body, SECRET, 300),
            Err(SignatureError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn zero_tolerance_disables_staleness_check() {
        let body = b"body";
        let old = chrono::Utc::now().timestamp() - 86_400;
        let headers = headers_with(&signature_header(SECRET, old, body));

        assert_eq!(verify(&headers, body, SECRET, 0), Ok(()));
    }
}
