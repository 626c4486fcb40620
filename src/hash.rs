//! Content hashing: SHA-1 and SHA-3-256 name blobs; MD5 backs the Z/R card
//! digests. All three expose the same incremental interface.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha3::Sha3_256;

use crate::constants::{STRLEN_SHA1, STRLEN_SHA3};
use crate::error::Result;

// ============================================================================
// Algorithms
// ============================================================================

/// The two algorithms that may name a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
  Sha1,
  Sha3,
}

impl HashAlgo {
  /// Hex length of this algorithm's digest.
  pub fn hex_len(self) -> usize {
    match self {
      HashAlgo::Sha1 => STRLEN_SHA1,
      HashAlgo::Sha3 => STRLEN_SHA3,
    }
  }

  /// Classify a full hash by its length, if it has one of the two legal
  /// lengths.
  pub fn of_uuid(uuid: &str) -> Option<HashAlgo> {
    match uuid.len() {
      STRLEN_SHA1 => Some(HashAlgo::Sha1),
      STRLEN_SHA3 => Some(HashAlgo::Sha3),
      _ => None,
    }
  }
}

/// Is `s` a full hash: 40 or 64 lowercase hex characters?
pub fn is_uuid(s: &str) -> bool {
  (s.len() == STRLEN_SHA1 || s.len() == STRLEN_SHA3) && is_lower_hex(s)
}

/// Is `s` composed solely of lowercase hex digits?
pub fn is_lower_hex(s: &str) -> bool {
  !s.is_empty()
    && s
      .bytes()
      .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Is `s` usable as a hash prefix (4..=64 hex chars, any case accepted by
/// the resolver after lowercasing)?
pub fn is_uuid_prefix(s: &str) -> bool {
  (crate::constants::UUID_PREFIX_MIN..=STRLEN_SHA3).contains(&s.len())
    && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ============================================================================
// Incremental hashers
// ============================================================================

/// An in-progress digest over one of the supported algorithms.
pub enum Hasher {
  Sha1(Sha1),
  Sha3(Box<Sha3_256>),
  Md5(Md5),
}

impl Hasher {
  pub fn new(algo: HashAlgo) -> Self {
    match algo {
      HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
      HashAlgo::Sha3 => Hasher::Sha3(Box::new(Sha3_256::new())),
    }
  }

  pub fn md5() -> Self {
    Hasher::Md5(Md5::new())
  }

  pub fn update(&mut self, bytes: &[u8]) {
    match self {
      Hasher::Sha1(h) => h.update(bytes),
      Hasher::Sha3(h) => h.update(bytes),
      Hasher::Md5(h) => h.update(bytes),
    }
  }

  /// Consume the hasher, yielding the lowercase hex digest.
  pub fn finalize_hex(self) -> String {
    match self {
      Hasher::Sha1(h) => hex::encode(h.finalize()),
      Hasher::Sha3(h) => hex::encode(h.finalize()),
      Hasher::Md5(h) => hex::encode(h.finalize()),
    }
  }
}

// ============================================================================
// One-shot helpers
// ============================================================================

pub fn sha1_hex(bytes: &[u8]) -> String {
  hex::encode(Sha1::digest(bytes))
}

pub fn sha3_hex(bytes: &[u8]) -> String {
  hex::encode(Sha3_256::digest(bytes))
}

pub fn md5_hex(bytes: &[u8]) -> String {
  hex::encode(Md5::digest(bytes))
}

/// Hash with the named algorithm.
pub fn hash_hex(algo: HashAlgo, bytes: &[u8]) -> String {
  match algo {
    HashAlgo::Sha1 => sha1_hex(bytes),
    HashAlgo::Sha3 => sha3_hex(bytes),
  }
}

/// Hash a file on disk, streamed in 8 KiB chunks.
pub fn hash_file(algo: HashAlgo, path: &Path) -> Result<String> {
  let mut f = File::open(path)?;
  let mut h = Hasher::new(algo);
  let mut buf = [0u8; 8192];
  loop {
    let n = f.read(&mut buf)?;
    if n == 0 {
      break;
    }
    h.update(&buf[..n]);
  }
  Ok(h.finalize_hex())
}

#[cfg(test)]
mod tests {
  use super::*;

  // RFC 3174 / FIPS-202 test vectors.
  #[test]
  fn test_sha1_vectors() {
    assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    assert_eq!(
      sha1_hex(b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq"),
      "84983e441c3bd26ebaae4aa1f95129e5e54670f1"
    );
  }

  #[test]
  fn test_sha3_vectors() {
    assert_eq!(
      sha3_hex(b""),
      "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
    );
    assert_eq!(
      sha3_hex(b"abc"),
      "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
    );
  }

  #[test]
  fn test_md5_vector() {
    assert_eq!(md5_hex(b""), crate::constants::MD5_EMPTY_HEX);
    assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
  }

  #[test]
  fn test_incremental_matches_oneshot() {
    let mut h = Hasher::new(HashAlgo::Sha3);
    h.update(b"ab");
    h.update(b"c");
    assert_eq!(h.finalize_hex(), sha3_hex(b"abc"));
  }

  #[test]
  fn test_uuid_classification() {
    let sha1 = sha1_hex(b"x");
    let sha3 = sha3_hex(b"x");
    assert!(is_uuid(&sha1));
    assert!(is_uuid(&sha3));
    assert_eq!(HashAlgo::of_uuid(&sha1), Some(HashAlgo::Sha1));
    assert_eq!(HashAlgo::of_uuid(&sha3), Some(HashAlgo::Sha3));
    assert!(!is_uuid("abcd"));
    assert!(is_uuid_prefix("abcd"));
    assert!(!is_uuid_prefix("abc"));
    assert!(!is_uuid_prefix("wxyz"));
  }

  #[test]
  fn test_hash_file_streams(){
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("blob.bin");
    std::fs::write(&p, b"hello\n").unwrap();
    assert_eq!(hash_file(HashAlgo::Sha1, &p).unwrap(), sha1_hex(b"hello\n"));
  }
}
