//! Provider message signatures
//!
//! Each provider signs an ordered concatenation of request fields. The order,
//! the presence of each field and the position of the secret are all part of
//! the provider contract, so callers pass the parts explicitly instead of a map.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// One element of the signed concatenation.
#[derive(Debug, Clone, Copy)]
pub enum SignedPart<'a> {
    Field { name: &'static str, value: &'a str },
    /// Position of the shared secret in keyed-concatenation schemes
    Secret,
}

impl<'a> SignedPart<'a> {
    pub fn field(name: &'static str, value: &'a str) -> Self {
        SignedPart::Field { name, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// MD5 over the concatenation with the secret embedded at its position
    Md5,
    /// HMAC-SHA256 keyed with the secret; `Secret` parts contribute nothing
    HmacSha256,
}

/// Compute the lowercase hex signature for `parts`.
pub fn compute(parts: &[SignedPart<'_>], secret: &str, algorithm: DigestAlgorithm) -> String {
    match algorithm {
        DigestAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            for part in parts {
                match part {
                    SignedPart::Field { value, .. } => hasher.update(value.as_bytes()),
                    SignedPart::Secret => hasher.update(secret.as_bytes()),
                }
            }
            hex::encode(hasher.finalize())
        }
        DigestAlgorithm::HmacSha256 => {
            // HMAC accepts keys of any length
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return String::new();
            };
            for part in parts {
                if let SignedPart::Field { value, .. } = part {
                    mac.update(value.as_bytes());
                }
            }
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

/// Check `provided` against the signature of `parts`.
///
/// Comparison is constant-time over the lowercase hex form. A `false` result
/// is an authentication failure, not a malformed request.
pub fn verify(
    parts: &[SignedPart<'_>],
    secret: &str,
    provided: &str,
    algorithm: DigestAlgorithm,
) -> bool {
    let expected = compute(parts, secret, algorithm);
    let provided = provided.trim().to_ascii_lowercase();

    if expected.is_empty() || expected.len() != provided.len() {
        tracing::debug!(
            fields = ?field_names(parts),
            "Signature length mismatch"
        );
        return false;
    }

    let matched: bool = expected.as_bytes().ct_eq(provided.as_bytes()).into();
    if !matched {
        tracing::debug!(fields = ?field_names(parts), "Signature mismatch");
    }
    matched
}

fn field_names(parts: &[SignedPart<'_>]) -> Vec<&'static str> {
    parts
        .iter()
        .map(|p| match p {
            SignedPart::Field { name, .. } => *name,
            SignedPart::Secret => "<secret>",
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vector() {
        // md5("abc")
        let parts = [SignedPart::field("a", "a"), SignedPart::Secret, SignedPart::field("c", "c")];
        assert_eq!(
            compute(&parts, "b", DigestAlgorithm::Md5),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let parts = [SignedPart::field("body", "what do ya want for nothing?")];
        assert_eq!(
            compute(&parts, "Jefe", DigestAlgorithm::HmacSha256),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_accepts_uppercase_hex() {
        let parts = [SignedPart::field("x", "1"), SignedPart::Secret];
        let sig = compute(&parts, "secret", DigestAlgorithm::Md5).to_uppercase();
        assert!(verify(&parts, "secret", &sig, DigestAlgorithm::Md5));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let parts = [SignedPart::field("x", "1"), SignedPart::Secret];
        let sig = compute(&parts, "secret", DigestAlgorithm::Md5);
        assert!(!verify(&parts, "other", &sig, DigestAlgorithm::Md5));
    }

    #[test]
    fn test_field_order_matters() {
        let forward = [SignedPart::field("a", "1"), SignedPart::field("b", "2")];
        let reversed = [SignedPart::field("b", "2"), SignedPart::field("a", "1")];
        let sig = compute(&forward, "k", DigestAlgorithm::HmacSha256);
        // "12" vs "21"
        assert!(!verify(&reversed, "k", &sig, DigestAlgorithm::HmacSha256));
    }

    #[test]
    fn test_empty_field_contributes_no_bytes() {
        // Presence of a field is decided by the adapter's parser; once present,
        // an empty value adds nothing to the signed bytes.
        let with_empty = [
            SignedPart::field("a", "1"),
            SignedPart::field("b", ""),
            SignedPart::Secret,
        ];
        let without = [SignedPart::field("a", "1"), SignedPart::Secret];
        assert_eq!(
            compute(&with_empty, "s", DigestAlgorithm::Md5),
            compute(&without, "s", DigestAlgorithm::Md5)
        );
    }

    #[test]
    fn test_verify_rejects_truncated_signature() {
        let parts = [SignedPart::field("x", "1")];
        let sig = compute(&parts, "k", DigestAlgorithm::HmacSha256);
        assert!(!verify(&parts, "k", &sig[..10], DigestAlgorithm::HmacSha256));
        assert!(!verify(&parts, "k", "", DigestAlgorithm::HmacSha256));
    }
}
