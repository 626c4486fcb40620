//! Deck serialization: canonical card emission with the trailing Z digest.

use crate::error::{Result, SiltError};
use crate::hash::Hasher;
use crate::util::time;

use super::{Deck, FilePerm};

// ============================================================================
// Token escaping
// ============================================================================

/// Escape a token for card emission: space and the control characters that
/// would break line/token structure.
pub fn fossilize(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '\\' => out.push_str("\\\\"),
      ' ' => out.push_str("\\s"),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\t' => out.push_str("\\t"),
      other => out.push(other),
    }
  }
  out
}

/// Inverse of [`fossilize`]. Unknown escapes keep the escaped character.
pub fn defossilize(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  let mut chars = s.chars();
  while let Some(c) = chars.next() {
    if c != '\\' {
      out.push(c);
      continue;
    }
    match chars.next() {
      Some('s') => out.push(' '),
      Some('n') => out.push('\n'),
      Some('r') => out.push('\r'),
      Some('t') => out.push('\t'),
      Some('\\') => out.push('\\'),
      Some(other) => out.push(other),
      None => out.push('\\'),
    }
  }
  out
}

// ============================================================================
// Serialization
// ============================================================================

fn require(deck: &Deck) -> Result<()> {
  for &card in deck.satype().required() {
    let present = match card {
      b'A' => deck.a.is_some(),
      b'D' => deck.d.is_some(),
      b'E' => deck.e.is_some(),
      b'J' => !deck.j.is_empty(),
      b'K' => deck.k.is_some(),
      b'L' => deck.l.is_some(),
      b'M' => !deck.m.is_empty(),
      b'T' => !deck.t.is_empty(),
      b'U' => deck.u.is_some(),
      b'W' => deck.w.is_some(),
      b'Z' => true, // always appended
      _ => true,
    };
    if !present {
      return Err(SiltError::new(
        crate::error::ErrorKind::MissingInfo,
        format!(
          "{} artifact lacks its required {}-card",
          deck.satype().label(),
          card as char
        ),
      ));
    }
  }
  Ok(())
}

/// Emit the canonical byte form of a deck, Z-card included. The deck must
/// be unshuffled first; output is byte-stable for equal decks.
pub fn serialize(deck: &Deck) -> Result<Vec<u8>> {
  require(deck)?;
  let mut out: Vec<u8> = Vec::with_capacity(512);
  let mut line = |out: &mut Vec<u8>, s: String| {
    out.extend_from_slice(s.as_bytes());
    out.push(b'\n');
  };

  if let Some(a) = &deck.a {
    let mut s = format!("A {} {}", fossilize(&a.name), fossilize(&a.target));
    if let Some(src) = &a.src {
      s.push(' ');
      s.push_str(src);
    }
    line(&mut out, s);
  }
  if let Some(b) = &deck.b {
    line(&mut out, format!("B {b}"));
  }
  if let Some(c) = &deck.c {
    line(&mut out, format!("C {}", fossilize(c)));
  }
  if let Some(d) = deck.d {
    line(&mut out, format!("D {}", time::julian_to_iso8601(d)));
  }
  if let Some((jd, id)) = &deck.e {
    line(&mut out, format!("E {} {id}", time::julian_to_iso8601(*jd)));
  }
  for fc in &deck.f {
    let mut s = format!("F {}", fossilize(&fc.name));
    if let Some(uuid) = &fc.uuid {
      s.push(' ');
      s.push_str(uuid);
      let need_perm = fc.perm != FilePerm::Regular || fc.prior_name.is_some();
      if need_perm {
        s.push(' ');
        s.push_str(fc.perm.token());
      }
      if let Some(prior) = &fc.prior_name {
        s.push(' ');
        s.push_str(&fossilize(prior));
      }
    }
    line(&mut out, s);
  }
  if let Some(g) = &deck.g {
    line(&mut out, format!("G {g}"));
  }
  if let Some(h) = &deck.h {
    line(&mut out, format!("H {}", fossilize(h)));
  }
  if let Some(i) = &deck.i {
    line(&mut out, format!("I {i}"));
  }
  for j in &deck.j {
    let mut s = String::from("J ");
    if j.append {
      s.push('+');
    }
    s.push_str(&fossilize(&j.field));
    if let Some(v) = &j.value {
      s.push(' ');
      s.push_str(&fossilize(v));
    }
    line(&mut out, s);
  }
  if let Some(k) = &deck.k {
    line(&mut out, format!("K {k}"));
  }
  if let Some(l) = &deck.l {
    line(&mut out, format!("L {}", fossilize(l)));
  }
  for m in &deck.m {
    line(&mut out, format!("M {m}"));
  }
  if let Some(n) = &deck.n {
    line(&mut out, format!("N {}", fossilize(n)));
  }
  if !deck.p.is_empty() {
    line(&mut out, format!("P {}", deck.p.join(" ")));
  }
  for q in &deck.q {
    let sign = if q.is_backout { '-' } else { '+' };
    line(&mut out, format!("Q {sign}{}", q.target));
  }
  if let Some(r) = &deck.r {
    line(&mut out, format!("R {r}"));
  }
  for t in &deck.t {
    let mut s = format!("T {}{}", t.tag_type.sigil(), fossilize(&t.name));
    s.push(' ');
    match &t.uuid {
      Some(u) => s.push_str(u),
      None => s.push('*'),
    }
    if let Some(v) = &t.value {
      s.push(' ');
      s.push_str(&fossilize(v));
    }
    line(&mut out, s);
  }
  if let Some(u) = &deck.u {
    line(&mut out, format!("U {}", fossilize(u)));
  }
  if let Some(w) = &deck.w {
    out.extend_from_slice(format!("W {}\n", w.len()).as_bytes());
    out.extend_from_slice(w.as_bytes());
    out.push(b'\n');
  }

  let mut md5 = Hasher::md5();
  md5.update(&out);
  out.extend_from_slice(format!("Z {}\n", md5.finalize_hex()).as_bytes());
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::deck::{FCard, SaType, TagType};

  #[test]
  fn test_fossilize_round_trip() {
    for s in ["plain", "two words", "tab\there", "multi\nline", "back\\slash"] {
      assert_eq!(defossilize(&fossilize(s)), s);
    }
  }

  #[test]
  fn test_serialize_orders_cards_and_closes_with_z() {
    let mut d = Deck::new(SaType::Checkin);
    d.set_user("alice").unwrap();
    d.set_date_iso("2022-02-02T02:02:02").unwrap();
    d.set_comment("two words").unwrap();
    d.add_fcard(FCard::new("f.txt", "a".repeat(40))).unwrap();
    d.unshuffle();
    let bytes = serialize(&d).unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "C two\\swords");
    assert_eq!(lines[1], "D 2022-02-02T02:02:02");
    assert!(lines[2].starts_with("F f.txt "));
    assert_eq!(lines[3], "U alice");
    assert!(lines[4].starts_with("Z "));
    // Z must be the MD5 of everything before it.
    let z_at = text.rfind("Z ").unwrap();
    let digest = crate::hash::md5_hex(&bytes[..z_at]);
    assert_eq!(&text[z_at + 2..z_at + 34], digest);
  }

  #[test]
  fn test_missing_required_card_is_rejected() {
    let mut d = Deck::new(SaType::Wiki);
    d.set_user("u").unwrap();
    d.set_date_iso("2022-01-01").unwrap();
    d.set_body("text").unwrap();
    // no L card
    let err = serialize(&d).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::MissingInfo);
  }

  #[test]
  fn test_control_artifact_form() {
    let mut d = Deck::new(SaType::Control);
    d.set_user("u").unwrap();
    d.set_date_iso("2022-01-01T00:00:00").unwrap();
    d.add_tag(TagType::Add, "sym-release", Some(&"b".repeat(40)), None)
      .unwrap();
    d.unshuffle();
    let text = String::from_utf8(serialize(&d).unwrap()).unwrap();
    assert!(text.contains(&format!("T +sym-release {}", "b".repeat(40))));
  }
}
