use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-derived key that joins every language variant of one document.
///
/// The value is the lowercase hex SHA-256 of the normalized bytes, so the file
/// name, upload time and requested language never influence it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentIdentity(String);

impl DocumentIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuilds an identity previously produced by [`identity_of`], e.g. from a URL path.
    pub fn from_hex(value: impl Into<String>) -> Option<Self> {
        let value = value.into().to_ascii_lowercase();
        let well_formed = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
        well_formed.then_some(Self(value))
    }
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn identity_of(bytes: &[u8]) -> DocumentIdentity {
    DocumentIdentity(format!("{:x}", Sha256::digest(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_same_identity() {
        assert_eq!(identity_of(b"ABC"), identity_of(b"ABC"));
    }

    #[test]
    fn different_content_different_identity() {
        assert_ne!(identity_of(b"ABC"), identity_of(b"ABD"));
        assert_ne!(identity_of(b""), identity_of(b"\0"));
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            identity_of(b"ABC").as_str(),
            "b5d4045c3f466fa91fe2cc6abe79232a1a57cdf104f7a26e716e0a1e2789df78"
        );
    }

    #[test]
    fn from_hex_round_trips_and_rejects_garbage() {
        let id = identity_of(b"report");
        assert_eq!(DocumentIdentity::from_hex(id.as_str().to_uppercase()), Some(id));
        assert_eq!(DocumentIdentity::from_hex("../etc/passwd"), None);
        assert_eq!(DocumentIdentity::from_hex("abc"), None);
    }
}
