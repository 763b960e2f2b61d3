//! Content checksums for drift and integrity detection.

use sha2::{Digest, Sha256};

/// Incremental digest computation.
pub trait ChecksumHasher: Send {
    /// Feed more bytes into the digest.
    fn update(&mut self, bytes: &[u8]);

    /// Finish and return the lowercase hex digest.
    fn finalize(self: Box<Self>) -> String;
}

/// Computes content hashes for migration files and backup artifacts.
///
/// Implementations must be pure and deterministic.
pub trait ChecksumProvider: Send + Sync {
    /// Name of the algorithm, recorded next to stored digests.
    fn algorithm(&self) -> &'static str;

    /// Start an incremental digest.
    fn hasher(&self) -> Box<dyn ChecksumHasher>;

    /// Hash a complete payload.
    fn hash(&self, bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hasher.finalize()
    }
}

/// SHA-256 checksums (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

struct Sha256Hasher(Sha256);

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

impl ChecksumProvider for Sha256Checksum {
    fn algorithm(&self) -> &'static str {
        "sha256"
    }

    fn hasher(&self) -> Box<dyn ChecksumHasher> {
        Box::new(Sha256Hasher(Sha256::new()))
    }
}

/// BLAKE3 checksums.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Checksum;

struct Blake3Hasher(blake3::Hasher);

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self: Box<Self>) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

impl ChecksumProvider for Blake3Checksum {
    fn algorithm(&self) -> &'static str {
        "blake3"
    }

    fn hasher(&self) -> Box<dyn ChecksumHasher> {
        Box::new(Blake3Hasher(blake3::Hasher::new()))
    }
}

/// Look up a provider by algorithm name.
pub fn provider_for(algorithm: &str) -> Option<Box<dyn ChecksumProvider>> {
    match algorithm {
        "sha256" => Some(Box::new(Sha256Checksum)),
        "blake3" => Some(Box::new(Blake3Checksum)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_digest() {
        assert_eq!(
            Sha256Checksum.hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        for provider in [
            Box::new(Sha256Checksum) as Box<dyn ChecksumProvider>,
            Box::new(Blake3Checksum),
        ] {
            let mut hasher = provider.hasher();
            hasher.update(b"CREATE TABLE users ");
            hasher.update(b"(id INTEGER PRIMARY KEY);");
            assert_eq!(
                hasher.finalize(),
                provider.hash(b"CREATE TABLE users (id INTEGER PRIMARY KEY);"),
                "{}",
                provider.algorithm()
            );
        }
    }

    #[test]
    fn test_single_byte_change_changes_digest() {
        let a = Blake3Checksum.hash(b"ALTER TABLE users ADD COLUMN age INTEGER;");
        let b = Blake3Checksum.hash(b"ALTER TABLE users ADD COLUMN age INTEGEr;");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_provider_lookup() {
        assert_eq!(provider_for("sha256").unwrap().algorithm(), "sha256");
        assert_eq!(provider_for("blake3").unwrap().algorithm(), "blake3");
        assert!(provider_for("md5").is_none());
    }
}
