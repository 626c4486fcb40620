//! Line-oriented three-way merge.
//!
//! Given a pivot (common ancestor), the local edit and the incoming edit,
//! produce a merged buffer. Regions edited on only one side take that
//! side; regions edited identically on both sides collapse; anything else
//! is emitted between conflict markers and counted.

use crate::error::{ErrorKind, Result, SiltError};

/// Conflict region framing, one marker per line.
const MARKER_LOCAL: &str =
  "<<<<<<< BEGIN MERGE CONFLICT: local copy shown first <<<<<<<<<<<<<<<<<<<<<<<";
const MARKER_PIVOT: &str =
  "||||||| COMMON ANCESTOR content follows ||||||||||||||||||||||||||||||||||||";
const MARKER_OTHER: &str =
  "======= MERGED IN content follows ==========================================";
const MARKER_END: &str =
  ">>>>>>> END MERGE CONFLICT >>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>";

/// Result of a merge: the produced bytes and how many conflict regions
/// were emitted.
#[derive(Debug)]
pub struct MergeResult {
  pub bytes: Vec<u8>,
  pub conflicts: usize,
}

/// Heuristic binary test: a NUL byte in the leading window.
pub fn looks_binary(bytes: &[u8]) -> bool {
  bytes.iter().take(8192).any(|&b| b == 0)
}

/// Split into lines, each keeping its terminator.
fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
  let mut out = Vec::new();
  let mut start = 0;
  for (i, &b) in bytes.iter().enumerate() {
    if b == b'\n' {
      out.push(&bytes[start..=i]);
      start = i + 1;
    }
  }
  if start < bytes.len() {
    out.push(&bytes[start..]);
  }
  out
}

// ============================================================================
// Pairwise matching (patience-style)
// ============================================================================

/// Stable line pairs between `a` and `b`: common prefix/suffix plus
/// unique-line anchors, recursively.
fn match_lines(a: &[&[u8]], b: &[&[u8]]) -> Vec<(usize, usize)> {
  let mut pairs = Vec::new();
  match_region(a, b, 0, 0, a.len(), b.len(), &mut pairs);
  pairs
}

#[allow(clippy::too_many_arguments)]
fn match_region(
  a: &[&[u8]],
  b: &[&[u8]],
  a0: usize,
  b0: usize,
  a1: usize,
  b1: usize,
  pairs: &mut Vec<(usize, usize)>,
) {
  let (mut a0, mut b0, mut a1, mut b1) = (a0, b0, a1, b1);
  // Common prefix.
  while a0 < a1 && b0 < b1 && a[a0] == b[b0] {
    pairs.push((a0, b0));
    a0 += 1;
    b0 += 1;
  }
  // Common suffix (recorded after the recursion keeps pairs ordered).
  let mut suffix = Vec::new();
  while a1 > a0 && b1 > b0 && a[a1 - 1] == b[b1 - 1] {
    a1 -= 1;
    b1 -= 1;
    suffix.push((a1, b1));
  }
  if a0 < a1 && b0 < b1 {
    // Anchor on lines unique in both regions, in longest-increasing order.
    let mut count_a: std::collections::HashMap<&[u8], (usize, usize)> =
      std::collections::HashMap::new();
    for i in a0..a1 {
      count_a.entry(a[i]).or_insert((0, i)).0 += 1;
    }
    let mut anchors: Vec<(usize, usize)> = Vec::new();
    let mut count_b: std::collections::HashMap<&[u8], usize> = std::collections::HashMap::new();
    for j in b0..b1 {
      *count_b.entry(b[j]).or_insert(0) += 1;
    }
    let mut used_a = a0;
    for j in b0..b1 {
      if count_b.get(b[j]) != Some(&1) {
        continue;
      }
      if let Some(&(na, i)) = count_a.get(b[j]) {
        // Greedy increasing selection keeps this linear; good enough for
        // merge-sized inputs.
        if na == 1 && i >= used_a {
          anchors.push((i, j));
          used_a = i + 1;
        }
      }
    }
    if anchors.is_empty() {
      // No anchors: the whole region is a replacement.
    } else {
      let mut pa = a0;
      let mut pb = b0;
      for (i, j) in anchors {
        match_region(a, b, pa, pb, i, j, pairs);
        pairs.push((i, j));
        pa = i + 1;
        pb = j + 1;
      }
      match_region(a, b, pa, pb, a1, b1, pairs);
    }
  }
  suffix.reverse();
  pairs.extend(suffix);
}

// ============================================================================
// Three-way walk
// ============================================================================

/// Merge `local` and `other` against their common ancestor `pivot`.
/// Binary input on any side is refused with a `Type` error; the caller
/// falls back to taking one side verbatim.
pub fn merge3(pivot: &[u8], local: &[u8], other: &[u8]) -> Result<MergeResult> {
  if looks_binary(pivot) || looks_binary(local) || looks_binary(other) {
    return Err(SiltError::new(
      ErrorKind::Type,
      "cannot line-merge binary content",
    ));
  }
  let p = split_lines(pivot);
  let l = split_lines(local);
  let o = split_lines(other);

  // pivot-index -> side-index maps of stable lines.
  let mut pl: Vec<Option<usize>> = vec![None; p.len()];
  for (pi, li) in match_lines(&p, &l) {
    pl[pi] = Some(li);
  }
  let mut po: Vec<Option<usize>> = vec![None; p.len()];
  for (pi, oi) in match_lines(&p, &o) {
    po[pi] = Some(oi);
  }

  let mut out: Vec<u8> = Vec::with_capacity(local.len().max(other.len()));
  let mut conflicts = 0usize;
  let (mut pi, mut li, mut oi) = (0usize, 0usize, 0usize);

  loop {
    // Emit fully-stable lines.
    while pi < p.len() && pl[pi] == Some(li) && po[pi] == Some(oi) {
      out.extend_from_slice(p[pi]);
      pi += 1;
      li += 1;
      oi += 1;
    }
    if pi >= p.len() && li >= l.len() && oi >= o.len() {
      break;
    }
    // Find the next pivot line stable on both sides, ahead of our cursors.
    let mut stop = pi;
    while stop < p.len() {
      if let (Some(sl), Some(so)) = (pl[stop], po[stop]) {
        if sl >= li && so >= oi {
          break;
        }
      }
      stop += 1;
    }
    let (lstop, ostop) = if stop < p.len() {
      (pl[stop].expect("checked above"), po[stop].expect("checked above"))
    } else {
      (l.len(), o.len())
    };

    let pivot_chunk = &p[pi..stop.min(p.len())];
    let local_chunk = &l[li..lstop];
    let other_chunk = &o[oi..ostop];

    let local_changed = local_chunk != pivot_chunk;
    let other_changed = other_chunk != pivot_chunk;
    match (local_changed, other_changed) {
      (false, _) => {
        for line in other_chunk {
          out.extend_from_slice(line);
        }
      }
      (true, false) => {
        for line in local_chunk {
          out.extend_from_slice(line);
        }
      }
      (true, true) if local_chunk == other_chunk => {
        for line in local_chunk {
          out.extend_from_slice(line);
        }
      }
      (true, true) => {
        conflicts += 1;
        out.extend_from_slice(MARKER_LOCAL.as_bytes());
        out.push(b'\n');
        for line in local_chunk {
          out.extend_from_slice(line);
        }
        out.extend_from_slice(MARKER_PIVOT.as_bytes());
        out.push(b'\n');
        for line in pivot_chunk {
          out.extend_from_slice(line);
        }
        out.extend_from_slice(MARKER_OTHER.as_bytes());
        out.push(b'\n');
        for line in other_chunk {
          out.extend_from_slice(line);
        }
        out.extend_from_slice(MARKER_END.as_bytes());
        out.push(b'\n');
      }
    }
    pi = stop;
    li = lstop;
    oi = ostop;
  }

  Ok(MergeResult {
    bytes: out,
    conflicts,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_clean_merge_of_disjoint_edits() {
    let pivot = b"one\ntwo\nthree\nfour\nfive\n";
    let local = b"ONE\ntwo\nthree\nfour\nfive\n";
    let other = b"one\ntwo\nthree\nfour\nFIVE\n";
    let m = merge3(pivot, local, other).unwrap();
    assert_eq!(m.conflicts, 0);
    assert_eq!(m.bytes, b"ONE\ntwo\nthree\nfour\nFIVE\n");
  }

  #[test]
  fn test_identical_edits_collapse() {
    let pivot = b"a\nb\nc\n";
    let edit = b"a\nB!\nc\n";
    let m = merge3(pivot, edit, edit).unwrap();
    assert_eq!(m.conflicts, 0);
    assert_eq!(m.bytes, edit.to_vec());
  }

  #[test]
  fn test_conflicting_edits_are_marked() {
    let pivot = b"1\n2\n3\n";
    let local = b"1\nX\n3\n";
    let other = b"1\nY\n3\n";
    let m = merge3(pivot, local, other).unwrap();
    assert_eq!(m.conflicts, 1);
    let text = String::from_utf8(m.bytes).unwrap();
    assert!(text.starts_with("1\n"));
    assert!(text.ends_with("3\n"));
    assert!(text.contains("BEGIN MERGE CONFLICT"));
    assert!(text.contains("\nX\n"));
    assert!(text.contains("\nY\n"));
    assert!(text.contains("END MERGE CONFLICT"));
  }

  #[test]
  fn test_one_sided_addition() {
    let pivot = b"a\nb\n";
    let local = b"a\nb\n";
    let other = b"a\nmid\nb\nend\n";
    let m = merge3(pivot, local, other).unwrap();
    assert_eq!(m.conflicts, 0);
    assert_eq!(m.bytes, other.to_vec());
  }

  #[test]
  fn test_binary_is_refused() {
    let err = merge3(b"a\0b", b"x", b"y").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
    assert!(looks_binary(b"a\0b"));
    assert!(!looks_binary(b"plain text\n"));
  }
}
