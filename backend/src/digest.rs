use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

/// Content fingerprint of a published document.
///
/// This is the git blob object id (`sha1("blob {len}\0" + bytes)`), which is
/// exactly what the repository host reports for file contents. Computing the
/// same digest locally lets us compare a freshly generated document against a
/// published one without shipping the content anywhere, and doubles as the
/// expected base for contents-API updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the git blob digest of `content`.
pub fn blob_digest(content: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", content.len()).as_bytes());
    hasher.update(content);
    Digest(hex::encode(hasher.finalize()))
}

/// First 8 characters of a commit sha, for log fields.
pub fn short_sha(sha: &str) -> &str {
    if sha.len() < 8 { sha } else { &sha[..8] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_git_hash_object() {
        // `git hash-object` on the same inputs
        assert_eq!(
            blob_digest(b"").as_str(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        assert_eq!(
            blob_digest(b"hello world\n").as_str(),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
    }

    #[test]
    fn deterministic_and_content_addressed() {
        let a = blob_digest(b"# readme\n");
        let b = blob_digest(b"# readme\n");
        let c = blob_digest(b"# readme");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short_sha("3b18e512dba79e4c8300dd08aeb37f8e728b8dad"), "3b18e512");
        assert_eq!(short_sha("abc"), "abc");
    }
}
