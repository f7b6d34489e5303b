//! HTTP Basic authentication against a single configured credential pair.

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Credentials;

/// Value of the `WWW-Authenticate` header sent with every `401`.
pub const CHALLENGE: &str = "Basic realm=\"restricted\"";

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no basic auth credentials supplied")]
    Missing,
    #[error("malformed Authorization header")]
    Malformed,
    #[error("wrong username or password")]
    Mismatch,
}

#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    expected: Option<Credentials>,
}

impl AccessGate {
    /// `None` lets every request through.
    pub fn new(expected: Option<Credentials>) -> Self {
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Checks the request's `Authorization` header.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthFailure> {
        let Some(expected) = &self.expected else {
            return Ok(());
        };

        let supplied = parse_basic_auth(headers)?;

        // Both comparisons always run; `&` on `Choice` doesn't short-circuit.
        let matches = digest_eq(&supplied.username, &expected.username)
            & digest_eq(&supplied.password, &expected.password);
        if bool::from(matches) {
            Ok(())
        } else {
            Err(AuthFailure::Mismatch)
        }
    }
}

/// Compares SHA-256 digests rather than the strings themselves, so the comparison covers the
/// same number of bytes whatever the lengths involved.
fn digest_eq(supplied: &str, expected: &str) -> subtle::Choice {
    let supplied = Sha256::digest(supplied.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    supplied.as_slice().ct_eq(expected.as_slice())
}

/// Extracts `user:password` from `Authorization: Basic ...`.
pub fn parse_basic_auth(headers: &HeaderMap) -> Result<Credentials, AuthFailure> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthFailure::Missing)?
        .to_str()
        .map_err(|_| AuthFailure::Malformed)?;

    let (scheme, encoded) = value.trim().split_once(' ').ok_or(AuthFailure::Malformed)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthFailure::Malformed);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthFailure::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::Malformed)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthFailure::Malformed)?;

    Ok(Credentials::new(username, password))
}
