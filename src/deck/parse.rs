//! Deck parsing: bytes to a validated in-memory artifact.

use std::collections::HashSet;

use crate::error::{ErrorKind, Result, SiltError};
use crate::hash::{is_uuid, md5_hex};
use crate::util::time;

use super::output::defossilize;
use super::{ACard, Deck, FCard, FilePerm, JCard, QCard, SaType, TCard, TagType};

const PGP_BEGIN: &[u8] = b"-----BEGIN PGP SIGNED MESSAGE-----";
const PGP_SIGNATURE: &[u8] = b"-----BEGIN PGP SIGNATURE-----";

/// Letters that may repeat within one artifact.
fn is_multi_card(letter: u8) -> bool {
  matches!(letter, b'F' | b'J' | b'M' | b'Q' | b'T')
}

fn syntax(msg: impl Into<String>) -> SiltError {
  SiltError::syntax(msg)
}

/// Strip a PGP clearsign wrapper, when present. The named hash of a signed
/// artifact covers only the inner payload.
fn signed_payload(bytes: &[u8]) -> &[u8] {
  if !bytes.starts_with(PGP_BEGIN) {
    return bytes;
  }
  // Header block runs to the first blank line.
  let mut pos = 0;
  while pos < bytes.len() {
    let nl = match bytes[pos..].iter().position(|&b| b == b'\n') {
      Some(n) => pos + n,
      None => return bytes,
    };
    if nl == pos {
      pos = nl + 1;
      break;
    }
    pos = nl + 1;
  }
  let body = &bytes[pos..];
  let end = body
    .windows(PGP_SIGNATURE.len())
    .position(|w| w == PGP_SIGNATURE)
    .unwrap_or(body.len());
  &body[..end]
}

/// Parse an artifact. With `expect = SaType::Any` the type is detected
/// from the card set; otherwise the card set must be legal for `expect`.
pub fn parse(bytes: &[u8], expect: SaType) -> Result<Deck> {
  let payload = signed_payload(bytes);
  if payload.is_empty() {
    return Err(syntax("empty artifact"));
  }

  let mut deck = Deck::default();
  let mut present: HashSet<u8> = HashSet::new();
  let mut prev_letter = 0u8;
  let mut last_f_name: Option<String> = None;
  let mut pos = 0usize;
  let mut z_seen = false;

  while pos < payload.len() {
    let line_start = pos;
    let nl = payload[pos..]
      .iter()
      .position(|&b| b == b'\n')
      .map(|n| pos + n)
      .ok_or_else(|| syntax("artifact line lacks its newline terminator"))?;
    let line = std::str::from_utf8(&payload[pos..nl])
      .map_err(|_| syntax("artifact is not valid UTF-8"))?;
    pos = nl + 1;

    let lb = line.as_bytes();
    if lb.is_empty() || !lb[0].is_ascii_uppercase() {
      return Err(syntax(format!("malformed card line: {line:?}")));
    }
    let letter = lb[0];
    if lb.len() < 2 || lb[1] != b' ' {
      return Err(syntax(format!("card {} lacks its argument", letter as char)));
    }
    if letter < prev_letter {
      return Err(syntax(format!(
        "{}-card out of order after {}",
        letter as char, prev_letter as char
      )));
    }
    if letter == prev_letter && !is_multi_card(letter) {
      return Err(syntax(format!("duplicate {}-card", letter as char)));
    }
    prev_letter = letter;
    present.insert(letter);

    let args: Vec<&str> = line[2..].split(' ').collect();
    let arg = |i: usize| -> Result<&str> {
      args
        .get(i)
        .copied()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| syntax(format!("{}-card missing argument {i}", letter as char)))
    };
    let uuid_arg = |i: usize| -> Result<String> {
      let a = arg(i)?;
      if !is_uuid(a) {
        return Err(syntax(format!(
          "{}-card argument is not a hash: {a:?}",
          letter as char
        )));
      }
      Ok(a.to_string())
    };

    match letter {
      b'A' => {
        deck.a = Some(ACard {
          name: defossilize(arg(0)?),
          target: defossilize(arg(1)?),
          src: args.get(2).filter(|s| !s.is_empty()).map(|s| s.to_string()),
        });
      }
      b'B' => deck.b = Some(uuid_arg(0)?),
      b'C' => deck.c = Some(defossilize(arg(0)?)),
      b'D' => deck.d = Some(time::iso8601_to_julian(arg(0)?).map_err(|e| syntax(e.message()))?),
      b'E' => {
        let jd = time::iso8601_to_julian(arg(0)?).map_err(|e| syntax(e.message()))?;
        deck.e = Some((jd, uuid_arg(1)?));
      }
      b'F' => {
        let name = defossilize(arg(0)?);
        if !crate::util::path::is_simple_pathname(&name) {
          return Err(syntax(format!("F-card name is not a simple path: {name:?}")));
        }
        if let Some(prev) = &last_f_name {
          if *prev >= name {
            return Err(syntax(format!("F-cards out of order at {name:?}")));
          }
        }
        last_f_name = Some(name.clone());
        let uuid = match args.get(1).filter(|s| !s.is_empty()) {
          Some(_) => Some(uuid_arg(1)?),
          None => None,
        };
        let perm = match args.get(2).filter(|s| !s.is_empty()) {
          Some(tok) => FilePerm::from_token(tok)
            .ok_or_else(|| syntax(format!("unknown F-card permission {tok:?}")))?,
          None => FilePerm::Regular,
        };
        let prior_name = args
          .get(3)
          .filter(|s| !s.is_empty())
          .map(|s| defossilize(s));
        deck.f.push(FCard {
          name,
          uuid,
          perm,
          prior_name,
        });
      }
      b'G' => deck.g = Some(uuid_arg(0)?),
      b'H' => deck.h = Some(defossilize(arg(0)?)),
      b'I' => deck.i = Some(uuid_arg(0)?),
      b'J' => {
        let raw = arg(0)?;
        let (field, append) = match raw.strip_prefix('+') {
          Some(rest) => (rest, true),
          None => (raw, false),
        };
        deck.j.push(JCard {
          field: defossilize(field),
          value: args.get(1).map(|s| defossilize(s)),
          append,
        });
      }
      b'K' => deck.k = Some(uuid_arg(0)?),
      b'L' => deck.l = Some(defossilize(arg(0)?)),
      b'M' => deck.m.push(uuid_arg(0)?),
      b'N' => deck.n = Some(defossilize(arg(0)?)),
      b'P' => {
        for (i, a) in args.iter().enumerate() {
          if a.is_empty() {
            continue;
          }
          deck.p.push(uuid_arg(i)?);
        }
      }
      b'Q' => {
        let raw = arg(0)?;
        let (is_backout, target) = match raw.as_bytes().first() {
          Some(b'+') => (false, &raw[1..]),
          Some(b'-') => (true, &raw[1..]),
          _ => return Err(syntax(format!("Q-card lacks its sign: {raw:?}"))),
        };
        if !is_uuid(target) {
          return Err(syntax(format!("Q-card target is not a hash: {target:?}")));
        }
        deck.q.push(QCard {
          target: target.to_string(),
          is_backout,
        });
      }
      b'R' => {
        let a = arg(0)?;
        if a.len() != crate::constants::STRLEN_MD5 || !crate::hash::is_lower_hex(a) {
          return Err(syntax(format!("R-card is not an MD5 digest: {a:?}")));
        }
        deck.r = Some(a.to_string());
      }
      b'T' => {
        let raw = arg(0)?;
        let mut chars = raw.chars();
        let tag_type = match chars.next() {
          Some('+') => TagType::Add,
          Some('-') => TagType::Cancel,
          Some('*') => TagType::Propagating,
          _ => return Err(syntax(format!("T-card lacks its sigil: {raw:?}"))),
        };
        let name = defossilize(chars.as_str());
        if !super::is_valid_tag_name(&name) {
          return Err(syntax(format!("invalid tag name: {name:?}")));
        }
        let target = arg(1)?;
        let uuid = if target == "*" {
          None
        } else {
          Some(uuid_arg(1)?)
        };
        deck.t.push(TCard {
          tag_type,
          name,
          uuid,
          value: args.get(2).map(|s| defossilize(s)),
        });
      }
      b'U' => deck.u = Some(defossilize(arg(0)?)),
      b'W' => {
        let len: usize = arg(0)?
          .parse()
          .map_err(|_| syntax("W-card size does not parse"))?;
        if pos + len + 1 > payload.len() {
          return Err(syntax("W-card body overruns the artifact"));
        }
        let body = std::str::from_utf8(&payload[pos..pos + len])
          .map_err(|_| syntax("W-card body is not valid UTF-8"))?;
        deck.w = Some(body.to_string());
        if payload[pos + len] != b'\n' {
          return Err(syntax("W-card body lacks its trailing newline"));
        }
        pos += len + 1;
      }
      b'Z' => {
        let stated = arg(0)?;
        if stated.len() != crate::constants::STRLEN_MD5 || !crate::hash::is_lower_hex(stated) {
          return Err(syntax(format!("Z-card is not an MD5 digest: {stated:?}")));
        }
        let actual = md5_hex(&payload[..line_start]);
        if actual != stated {
          return Err(SiltError::new(
            ErrorKind::Consistency,
            format!("Z-card mismatch: stated {stated}, computed {actual}"),
          ));
        }
        if pos != payload.len() {
          return Err(syntax("content after the Z-card"));
        }
        z_seen = true;
      }
      other => {
        return Err(syntax(format!("unknown card letter {:?}", other as char)));
      }
    }
  }

  if !z_seen {
    return Err(syntax("artifact lacks its Z-card"));
  }

  let detected = detect_satype(&present);
  let satype = if expect == SaType::Any {
    detected.ok_or_else(|| syntax("card set matches no artifact type"))?
  } else {
    expect
  };
  for &letter in present.iter() {
    if letter != b'Z' && !satype.allows(letter) {
      return Err(SiltError::new(
        ErrorKind::Type,
        format!(
          "{}-card is illegal in a {} artifact",
          letter as char,
          satype.label()
        ),
      ));
    }
  }
  for &req in satype.required() {
    if !present.contains(&req) {
      return Err(syntax(format!(
        "{} artifact lacks its required {}-card",
        satype.label(),
        req as char
      )));
    }
  }
  deck.set_satype(satype);
  Ok(deck)
}

/// Pick the artifact type implied by the set of card letters present.
fn detect_satype(present: &HashSet<u8>) -> Option<SaType> {
  let has = |l: u8| present.contains(&l);
  if has(b'A') {
    Some(SaType::Attachment)
  } else if has(b'M') {
    Some(SaType::Cluster)
  } else if has(b'J') || has(b'K') {
    Some(SaType::Ticket)
  } else if has(b'L') {
    Some(SaType::Wiki)
  } else if has(b'E') {
    Some(SaType::Technote)
  } else if has(b'G') || has(b'H') || has(b'I') {
    Some(SaType::Forumpost)
  } else if has(b'F') || has(b'B') || has(b'Q') || has(b'R') || has(b'C') {
    Some(SaType::Checkin)
  } else if has(b'W') {
    Some(SaType::Forumpost)
  } else if has(b'T') && has(b'D') && has(b'U') {
    Some(SaType::Control)
  } else if has(b'D') && has(b'U') {
    Some(SaType::Checkin)
  } else {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::deck::output::serialize;
  use crate::deck::TagType as TT;

  fn sample_checkin() -> Deck {
    let mut d = Deck::new(SaType::Checkin);
    d.set_user("alice").unwrap();
    d.set_date_iso("2023-05-05T10:20:30").unwrap();
    d.set_comment("fix the widget").unwrap();
    d.add_fcard(FCard::new("src/lib.rs", "a".repeat(40))).unwrap();
    d.add_fcard(FCard::new("README.md", "c".repeat(40))).unwrap();
    d.add_parent(&"b".repeat(40)).unwrap();
    d.unshuffle();
    d
  }

  #[test]
  fn test_round_trip_is_byte_identical() {
    let d = sample_checkin();
    let bytes = serialize(&d).unwrap();
    let parsed = parse(&bytes, SaType::Any).unwrap();
    assert_eq!(parsed.satype(), SaType::Checkin);
    assert_eq!(parsed.u.as_deref(), Some("alice"));
    assert_eq!(parsed.f.len(), 2);
    assert_eq!(parsed.p, vec!["b".repeat(40)]);
    let mut parsed = parsed;
    parsed.unshuffle();
    assert_eq!(serialize(&parsed).unwrap(), bytes);
  }

  #[test]
  fn test_z_mismatch_is_consistency() {
    let mut bytes = serialize(&sample_checkin()).unwrap();
    // Corrupt one comment byte, leaving the Z card stale.
    let at = bytes.windows(3).position(|w| w == b"fix").unwrap();
    bytes[at] = b'F';
    let err = parse(&bytes, SaType::Any).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
  }

  #[test]
  fn test_out_of_order_cards_rejected() {
    let body = b"D 2023-01-01T00:00:00\nC late-comment\n";
    let z = md5_hex(body);
    let text = format!("{}Z {z}\n", String::from_utf8_lossy(body));
    let err = parse(text.as_bytes(), SaType::Any).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
  }

  #[test]
  fn test_duplicate_unique_card_rejected() {
    let body = b"D 2023-01-01T00:00:00\nD 2023-01-02T00:00:00\nU u\n";
    let z = md5_hex(body);
    let text = format!("{}Z {z}\n", String::from_utf8_lossy(body));
    let err = parse(text.as_bytes(), SaType::Any).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(err.message().contains("duplicate"));
  }

  #[test]
  fn test_wiki_detection_and_w_body() {
    let mut d = Deck::new(SaType::Wiki);
    d.set_user("bob").unwrap();
    d.set_date_iso("2021-03-04T05:06:07").unwrap();
    d.set_wiki_title("Home Page").unwrap();
    d.set_body("line one\nline two\n").unwrap();
    let bytes = serialize(&d).unwrap();
    let parsed = parse(&bytes, SaType::Any).unwrap();
    assert_eq!(parsed.satype(), SaType::Wiki);
    assert_eq!(parsed.l.as_deref(), Some("Home Page"));
    assert_eq!(parsed.w.as_deref(), Some("line one\nline two\n"));
  }

  #[test]
  fn test_illegal_card_for_expected_type() {
    let bytes = serialize(&sample_checkin()).unwrap();
    let err = parse(&bytes, SaType::Cluster).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
  }

  #[test]
  fn test_control_artifact_detection() {
    let mut d = Deck::new(SaType::Control);
    d.set_user("ops").unwrap();
    d.set_date_iso("2021-01-01T00:00:00").unwrap();
    d.add_tag(TT::Cancel, "sym-broken", Some(&"d".repeat(40)), None)
      .unwrap();
    d.unshuffle();
    let bytes = serialize(&d).unwrap();
    let parsed = parse(&bytes, SaType::Any).unwrap();
    assert_eq!(parsed.satype(), SaType::Control);
    assert_eq!(parsed.t.len(), 1);
    assert_eq!(parsed.t[0].tag_type, TT::Cancel);
  }

  #[test]
  fn test_pgp_wrapper_is_stripped() {
    let inner = serialize(&sample_checkin()).unwrap();
    let mut signed = Vec::new();
    signed.extend_from_slice(b"-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n");
    signed.extend_from_slice(&inner);
    signed.extend_from_slice(b"-----BEGIN PGP SIGNATURE-----\nxxx\n-----END PGP SIGNATURE-----\n");
    let parsed = parse(&signed, SaType::Any).unwrap();
    assert_eq!(parsed.satype(), SaType::Checkin);
    assert_eq!(parsed.u.as_deref(), Some("alice"));
  }
}
