// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Webhook authentication primitives.
//!
//! # Signed requests
//!
//! Direct webhooks sign the raw body: the sender computes
//! `HMAC-SHA256(secret, "v0:" + timestamp + ":" + body)` and ships it as
//! `v0=<lower-hex>` alongside the unix timestamp. Verification decodes the
//! claimed signature to its digest bytes, recomputes the digest locally,
//! and compares the two byte arrays with `subtle::ConstantTimeEq`.
//! Timestamps more than five minutes from local time — in either direction
//! — fail before any HMAC work is done, which bounds the replay window.
//!
//! # Bearer requests
//!
//! Deliveries forwarded through the proxy arrive pre-verified and carry
//! `Authorization: Bearer <shared-secret>` instead; the secret comparison
//! is constant-time as well.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Signed requests older (or newer) than this are treated as replays.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("request timestamp is too old (replay protection)")]
    StaleTimestamp,
    #[error("HMAC signature does not match")]
    InvalidSignature,
    #[error("missing or malformed Authorization header")]
    MissingBearer,
    #[error("bearer token does not match")]
    InvalidBearer,
    #[error("internal HMAC error")]
    Internal,
}

/// How a transport authenticates its requests.
#[derive(Clone)]
pub enum VerifyMode {
    /// HMAC-with-timestamp over the raw body.
    Hmac { secret: Vec<u8> },
    /// Shared secret behind a forwarding proxy.
    Bearer { secret: String },
}

impl VerifyMode {
    pub fn hmac(secret: impl AsRef<[u8]>) -> Self {
        VerifyMode::Hmac {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn bearer(secret: impl Into<String>) -> Self {
        VerifyMode::Bearer {
            secret: secret.into(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Strip `prefix` from a signature header and decode the hex digest.
///
/// Any shape problem — wrong scheme, odd hex, wrong digest length — maps to
/// `InvalidSignature`; callers never learn which part failed.
fn decode_signature(header: &str, prefix: &str) -> Result<[u8; 32], VerifyError> {
    let hex_digest = header
        .strip_prefix(prefix)
        .ok_or(VerifyError::InvalidSignature)?;
    let bytes = hex::decode(hex_digest).map_err(|_| VerifyError::InvalidSignature)?;
    bytes.try_into().map_err(|_| VerifyError::InvalidSignature)
}

fn hmac_digest(secret: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], VerifyError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| VerifyError::Internal)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn digests_match(expected: &[u8; 32], claimed: &[u8; 32]) -> bool {
    expected.ct_eq(claimed).into()
}

/// Verify a `v0:<timestamp>:<body>` signed request.
pub fn verify_signed_request(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    provided_sig: &str,
) -> Result<(), VerifyError> {
    let claimed = decode_signature(provided_sig, "v0=")?;

    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| VerifyError::InvalidTimestamp)?;
    // The skew check is symmetric: a timestamp from the future is as
    // suspect as a stale one.
    if unix_now().abs_diff(sent_at) > MAX_CLOCK_SKEW.as_secs() {
        return Err(VerifyError::StaleTimestamp);
    }

    let expected = hmac_digest(
        secret,
        &[b"v0:", timestamp.as_bytes(), b":", body],
    )?;
    if digests_match(&expected, &claimed) {
        Ok(())
    } else {
        Err(VerifyError::InvalidSignature)
    }
}

/// Verify a plain `sha256=<hex>` HMAC over the body (code-host style; the
/// delivery id, not a timestamp, provides replay protection there).
pub fn verify_plain_hmac(
    secret: &[u8],
    body: &[u8],
    provided_sig: &str,
) -> Result<(), VerifyError> {
    let claimed = decode_signature(provided_sig, "sha256=")?;
    let expected = hmac_digest(secret, &[body])?;
    if digests_match(&expected, &claimed) {
        Ok(())
    } else {
        Err(VerifyError::InvalidSignature)
    }
}

/// Verify an `Authorization: Bearer <secret>` header in constant time.
pub fn verify_bearer(expected_secret: &str, header: Option<&str>) -> Result<(), VerifyError> {
    let provided = header
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(VerifyError::MissingBearer)?;
    let matches: bool = provided
        .as_bytes()
        .ct_eq(expected_secret.as_bytes())
        .into();
    if matches {
        Ok(())
    } else {
        Err(VerifyError::InvalidBearer)
    }
}

/// Verify one request against the transport's configured mode.
pub fn verify_request(
    mode: &VerifyMode,
    timestamp: &str,
    auth_header: Option<&str>,
    signature: &str,
    body: &[u8],
) -> Result<(), VerifyError> {
    match mode {
        VerifyMode::Hmac { secret } => verify_signed_request(secret, timestamp, body, signature),
        VerifyMode::Bearer { secret } => verify_bearer(secret, auth_header),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
