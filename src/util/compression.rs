//! Length-prefixed zlib framing for stored blob content.
//!
//! Committed blob content is stored as `[u32 BE uncompressed size][zlib
//! deflate stream]`. A buffer is "compressed" iff it carries that prefix and
//! inflates cleanly to exactly the stated size.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{ErrorKind, Result, SiltError};

/// Compress `src` into the framed form.
pub fn compress(src: &[u8]) -> Result<Vec<u8>> {
  let mut out = Vec::with_capacity(src.len() / 2 + 8);
  let mut prefix = [0u8; 4];
  BigEndian::write_u32(&mut prefix, src.len() as u32);
  out.extend_from_slice(&prefix);
  let mut enc = ZlibEncoder::new(out, Compression::default());
  enc.write_all(src)?;
  Ok(enc.finish()?)
}

/// Cheap structural test: does `buf` look like a framed compressed buffer?
///
/// The zlib stream always starts with 0x78 for the window size deflate uses
/// here. Full validation happens in [`uncompress`].
pub fn is_compressed(buf: &[u8]) -> bool {
  buf.len() >= 6 && buf[4] == 0x78
}

/// Length stated by the frame prefix, without inflating.
pub fn compressed_size_of(buf: &[u8]) -> Result<u32> {
  if buf.len() < 4 {
    return Err(SiltError::new(
      ErrorKind::Range,
      "buffer too short for a compression frame",
    ));
  }
  Ok(BigEndian::read_u32(&buf[..4]))
}

/// Inflate a framed buffer, validating the decoded length against the
/// prefix.
pub fn uncompress(buf: &[u8]) -> Result<Vec<u8>> {
  let stated = compressed_size_of(buf)? as usize;
  let mut out = Vec::with_capacity(stated);
  let mut dec = ZlibDecoder::new(&buf[4..]);
  dec
    .read_to_end(&mut out)
    .map_err(|e| SiltError::new(ErrorKind::Error, format!("zlib inflate failed: {e}")))?;
  if out.len() != stated {
    return Err(SiltError::new(
      ErrorKind::SizeMismatch,
      format!("frame prefix says {stated} bytes, inflated to {}", out.len()),
    ));
  }
  Ok(out)
}

/// Inflate if framed, otherwise return the bytes as-is.
pub fn uncompress_if_needed(buf: &[u8]) -> Result<Vec<u8>> {
  if is_compressed(buf) {
    uncompress(buf)
  } else {
    Ok(buf.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_round_trip_identity() {
    for src in [
      &b""[..],
      b"hello",
      b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
      &[0u8, 1, 2, 255, 254, 0, 0, 0, 7][..],
    ] {
      let packed = compress(src).unwrap();
      assert!(is_compressed(&packed) || src.len() < 2);
      assert_eq!(compressed_size_of(&packed).unwrap() as usize, src.len());
      assert_eq!(uncompress(&packed).unwrap(), src);
    }
  }

  #[test]
  fn test_large_repetitive_input_shrinks() {
    let src = vec![b'x'; 100_000];
    let packed = compress(&src).unwrap();
    assert!(packed.len() < src.len() / 4);
    assert_eq!(uncompress(&packed).unwrap(), src);
  }

  #[test]
  fn test_corrupt_length_prefix_is_detected() {
    let mut packed = compress(b"some content to compress").unwrap();
    packed[3] = packed[3].wrapping_add(1);
    let err = uncompress(&packed).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);
  }

  #[test]
  fn test_plain_text_is_not_compressed() {
    assert!(!is_compressed(b"D 2021-01-01T00:00:00\n"));
  }
}
