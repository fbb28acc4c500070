//! Timestamp/nonce request signing shared with callers that hold an
//! application secret.
//!
//! `signature = UPPER_HEX(SHA256(timestamp || secret || nonce || timestamp))`

use dag_contracts::canonical::sha256_upper_hex;
use http::HeaderMap;
use subtle::ConstantTimeEq;
use ulid::Ulid;

use crate::AuthError;

pub const TIMESTAMP_HEADER: &str = "x-tif-timestamp";
pub const NONCE_HEADER: &str = "x-tif-nonce";
pub const SIGNATURE_HEADER: &str = "x-tif-signature";

pub const DEFAULT_MAX_SKEW_SECS: u64 = 180;

const ERR_SIGNATURE: &str = "ERR_SIGNATURE_INVALID";

pub fn sign(timestamp: &str, secret: &str, nonce: &str) -> String {
    let mut material =
        String::with_capacity(timestamp.len() * 2 + secret.len() + nonce.len());
    material.push_str(timestamp);
    material.push_str(secret);
    material.push_str(nonce);
    material.push_str(timestamp);
    sha256_upper_hex(material.as_bytes())
}

/// The three signature headers of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl SignedHeaders {
    /// Reads the headers of an inbound request. Each missing header is
    /// reported by name.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let read = |name: &'static str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| AuthError {
                    code: ERR_SIGNATURE,
                    message: format!("{} header is missing", name),
                })
        };

        Ok(Self {
            timestamp: read(TIMESTAMP_HEADER)?,
            nonce: read(NONCE_HEADER)?,
            signature: read(SIGNATURE_HEADER)?,
        })
    }

    /// Signs a fresh response with a new nonce.
    pub fn issue(secret: &str, now_secs: i64) -> Self {
        let timestamp = now_secs.to_string();
        let nonce = Ulid::new().to_string();
        let signature = sign(&timestamp, secret, &nonce);
        Self {
            timestamp,
            nonce,
            signature,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            (NONCE_HEADER, self.nonce.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
        .into_iter()
    }

    /// Checks freshness and the signature against `secret`.
    pub fn verify(&self, secret: &str, now_secs: i64, max_skew_secs: u64) -> Result<(), AuthError> {
        let timestamp = self.timestamp.parse::<i64>().map_err(|_| AuthError {
            code: ERR_SIGNATURE,
            message: format!("{} is not an integer", TIMESTAMP_HEADER),
        })?;

        if now_secs.abs_diff(timestamp) > max_skew_secs {
            return Err(AuthError {
                code: ERR_SIGNATURE,
                message: format!("{} has expired", TIMESTAMP_HEADER),
            });
        }

        let expected = sign(&self.timestamp, secret, &self.nonce);
        let matches: bool = expected
            .as_bytes()
            .ct_eq(self.signature.as_bytes())
            .into();
        if !matches {
            return Err(AuthError {
                code: ERR_SIGNATURE,
                message: format!("{} does not match", SIGNATURE_HEADER),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &str = "D58E7FC94B514F31EDB73FCF2A56BA9B023C0B1046FFC5CFFE20EB5844081213";

    fn request(timestamp: &str, signature: &str) -> SignedHeaders {
        SignedHeaders {
            timestamp: timestamp.to_string(),
            nonce: "n".to_string(),
            signature: signature.to_string(),
        }
    }

    #[test]
    fn sign_matches_known_vector() {
        assert_eq!(sign("1700000000", "s", "n"), KNOWN);
    }

    #[test]
    fn verify_accepts_within_skew() {
        let req = request("1700000000", KNOWN);
        assert!(req.verify("s", 1_700_000_000, 180).is_ok());
        assert!(req.verify("s", 1_700_000_180, 180).is_ok());
        assert!(req.verify("s", 1_699_999_820, 180).is_ok());
    }

    #[test]
    fn verify_names_the_failing_field() {
        let req = request("1700000000", KNOWN);
        let err = req.verify("s", 1_700_000_181, 180).unwrap_err();
        assert!(err.message.contains(TIMESTAMP_HEADER));

        let err = req.verify("other", 1_700_000_000, 180).unwrap_err();
        assert!(err.message.contains(SIGNATURE_HEADER));

        let err = request("soon", KNOWN).verify("s", 0, 180).unwrap_err();
        assert!(err.message.contains(TIMESTAMP_HEADER));
    }

    #[test]
    fn missing_headers_are_reported_by_name() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, "1".parse().unwrap());
        let err = SignedHeaders::from_headers(&headers).unwrap_err();
        assert!(err.message.contains(NONCE_HEADER));
    }

    #[test]
    fn issued_headers_verify() {
        let issued = SignedHeaders::issue("s", 1_700_000_000);
        assert_eq!(issued.timestamp, "1700000000");
        assert!(issued.verify("s", 1_700_000_000, 180).is_ok());
        assert_eq!(issued.iter().count(), 3);
    }
}
