//! Structural artifacts ("decks").
//!
//! An artifact is a newline-terminated sequence of cards, each line led by
//! one uppercase letter, in strict alphabetical order, closed by a `Z` card
//! carrying the MD5 of everything before it. Each artifact type admits a
//! fixed card subset; an illegal combination makes the deck invalid.

mod output;
mod parse;

pub use output::{defossilize, fossilize, serialize};
pub use parse::parse;

use tracing::debug;

use crate::blob::Saved;
use crate::context::Fossil;
use crate::error::{ErrorKind, Result, SiltError};
use crate::util::time;

// ============================================================================
// Artifact types
// ============================================================================

/// Structural artifact type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaType {
  /// Wildcard for parsing: detect from the card set.
  Any,
  Checkin,
  Cluster,
  Control,
  Wiki,
  Ticket,
  Attachment,
  Technote,
  Forumpost,
}

impl SaType {
  pub fn label(self) -> &'static str {
    match self {
      SaType::Any => "any",
      SaType::Checkin => "checkin",
      SaType::Cluster => "cluster",
      SaType::Control => "control",
      SaType::Wiki => "wiki",
      SaType::Ticket => "ticket",
      SaType::Attachment => "attachment",
      SaType::Technote => "technote",
      SaType::Forumpost => "forumpost",
    }
  }

  /// Type tag used in the `event` table.
  pub fn event_type(self) -> Option<&'static str> {
    match self {
      SaType::Checkin => Some("ci"),
      SaType::Wiki => Some("w"),
      SaType::Ticket => Some("t"),
      SaType::Technote => Some("e"),
      SaType::Forumpost => Some("f"),
      SaType::Attachment => Some("w"),
      _ => None,
    }
  }

  /// Which card letters this artifact type may carry.
  pub fn allows(self, card: u8) -> bool {
    let set: &[u8] = match self {
      SaType::Any => return true,
      SaType::Checkin => b"BCDFNPQRTUZ",
      SaType::Cluster => b"MZ",
      SaType::Control => b"DPTUZ",
      SaType::Wiki => b"DLUWZ",
      SaType::Ticket => b"DJKUZ",
      SaType::Attachment => b"ADUZ",
      SaType::Technote => b"DEUWZ",
      SaType::Forumpost => b"DGHIUWZ",
    };
    set.contains(&card)
  }

  /// Card letters that must be present.
  pub fn required(self) -> &'static [u8] {
    match self {
      SaType::Any => b"Z",
      SaType::Checkin => b"DUZ",
      SaType::Cluster => b"MZ",
      SaType::Control => b"DTUZ",
      SaType::Wiki => b"DLUWZ",
      SaType::Ticket => b"DJKUZ",
      SaType::Attachment => b"ADUZ",
      SaType::Technote => b"DEUZ",
      SaType::Forumpost => b"DUWZ",
    }
  }
}

// ============================================================================
// Card payloads
// ============================================================================

/// File permission in an F-card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePerm {
  #[default]
  Regular,
  Exe,
  Link,
}

impl FilePerm {
  pub fn token(self) -> &'static str {
    match self {
      FilePerm::Regular => "w",
      FilePerm::Exe => "x",
      FilePerm::Link => "l",
    }
  }

  pub fn from_token(t: &str) -> Option<Self> {
    match t {
      "w" => Some(FilePerm::Regular),
      "x" => Some(FilePerm::Exe),
      "l" | "lnk" => Some(FilePerm::Link),
      _ => None,
    }
  }
}

/// One file entry. `uuid=None` marks a deletion and is legal only in delta
/// manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FCard {
  pub name: String,
  pub uuid: Option<String>,
  pub perm: FilePerm,
  pub prior_name: Option<String>,
}

impl FCard {
  pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      uuid: Some(uuid.into()),
      perm: FilePerm::Regular,
      prior_name: None,
    }
  }
}

/// Tag mutation type, stored in `tagxref.tagtype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
  Cancel,
  Add,
  Propagating,
}

impl TagType {
  pub fn sigil(self) -> char {
    match self {
      TagType::Cancel => '-',
      TagType::Add => '+',
      TagType::Propagating => '*',
    }
  }

  /// Numeric form used by the tagxref table.
  pub fn as_int(self) -> i64 {
    match self {
      TagType::Cancel => 0,
      TagType::Add => 1,
      TagType::Propagating => 2,
    }
  }
}

/// One T-card. `uuid=None` targets the containing artifact (`*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TCard {
  pub tag_type: TagType,
  pub name: String,
  pub uuid: Option<String>,
  pub value: Option<String>,
}

/// One Q-card: a cherry-pick (+) or backout (-) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QCard {
  pub target: String,
  pub is_backout: bool,
}

/// One J-card: a ticket field change; `append` is the `+` prefix form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JCard {
  pub field: String,
  pub value: Option<String>,
  pub append: bool,
}

/// The A-card of an attachment: target filename, attach-to artifact, and
/// optionally the content hash (absent = deletion of the attachment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ACard {
  pub name: String,
  pub target: String,
  pub src: Option<String>,
}

/// Tag names must match this shape.
pub fn is_valid_tag_name(name: &str) -> bool {
  !name.is_empty()
    && name
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/'))
}

// ============================================================================
// Deck
// ============================================================================

/// An in-memory structural artifact. Built programmatically or parsed from
/// blob bytes; sealed (rid/uuid set) once saved.
#[derive(Debug, Default)]
pub struct Deck {
  satype_: Option<SaType>,
  /// Local id once saved/loaded, else 0.
  pub rid: i64,
  /// Hash once saved/loaded.
  pub uuid: Option<String>,

  pub a: Option<ACard>,
  pub b: Option<String>,
  baseline: Option<Box<Deck>>,
  pub c: Option<String>,
  /// D-card as Julian Day.
  pub d: Option<f64>,
  /// E-card: (date, technote id).
  pub e: Option<(f64, String)>,
  pub f: Vec<FCard>,
  pub g: Option<String>,
  pub h: Option<String>,
  pub i: Option<String>,
  pub j: Vec<JCard>,
  pub k: Option<String>,
  pub l: Option<String>,
  pub m: Vec<String>,
  pub n: Option<String>,
  /// Parents, primary first. Order is semantic; never sorted.
  pub p: Vec<String>,
  pub q: Vec<QCard>,
  pub r: Option<String>,
  pub t: Vec<TCard>,
  pub u: Option<String>,
  pub w: Option<String>,
}

impl Deck {
  pub fn new(satype: SaType) -> Self {
    Self {
      satype_: Some(satype),
      ..Self::default()
    }
  }

  pub fn satype(&self) -> SaType {
    self.satype_.unwrap_or(SaType::Any)
  }

  pub(crate) fn set_satype(&mut self, t: SaType) {
    self.satype_ = Some(t);
  }

  fn allow(&self, card: u8) -> Result<()> {
    if self.satype().allows(card) {
      Ok(())
    } else {
      Err(SiltError::type_error(format!(
        "{} artifacts do not carry {}-cards",
        self.satype().label(),
        card as char
      )))
    }
  }

  fn mutable(&self) -> Result<()> {
    if self.rid != 0 {
      Err(SiltError::misuse("deck is sealed: it has been saved"))
    } else {
      Ok(())
    }
  }

  // ==========================================================================
  // Single-value card setters
  // ==========================================================================

  pub fn set_comment(&mut self, c: &str) -> Result<()> {
    self.allow(b'C')?;
    self.c = Some(c.to_string());
    Ok(())
  }

  pub fn set_date_julian(&mut self, jd: f64) -> Result<()> {
    self.allow(b'D')?;
    if !time::julian_in_range(jd) {
      return Err(SiltError::range(format!("julian day {jd} out of range")));
    }
    self.d = Some(jd);
    Ok(())
  }

  pub fn set_date_iso(&mut self, iso: &str) -> Result<()> {
    let jd = time::iso8601_to_julian(iso)?;
    self.set_date_julian(jd)
  }

  pub fn set_user(&mut self, u: &str) -> Result<()> {
    self.allow(b'U')?;
    self.u = Some(u.to_string());
    Ok(())
  }

  pub fn set_r_card(&mut self, md5: &str) -> Result<()> {
    self.allow(b'R')?;
    if md5.len() != crate::constants::STRLEN_MD5 || !crate::hash::is_lower_hex(md5) {
      return Err(SiltError::misuse(format!("not an MD5 digest: {md5:?}")));
    }
    self.r = Some(md5.to_string());
    Ok(())
  }

  pub fn set_baseline_uuid(&mut self, uuid: &str) -> Result<()> {
    self.allow(b'B')?;
    self.b = Some(uuid.to_string());
    Ok(())
  }

  pub fn set_mimetype(&mut self, n: &str) -> Result<()> {
    self.allow(b'N')?;
    self.n = Some(n.to_string());
    Ok(())
  }

  pub fn set_wiki_title(&mut self, l: &str) -> Result<()> {
    self.allow(b'L')?;
    self.l = Some(l.to_string());
    Ok(())
  }

  pub fn set_ticket_uuid(&mut self, k: &str) -> Result<()> {
    self.allow(b'K')?;
    self.k = Some(k.to_string());
    Ok(())
  }

  pub fn set_body(&mut self, w: &str) -> Result<()> {
    self.allow(b'W')?;
    self.w = Some(w.to_string());
    Ok(())
  }

  pub fn set_technote(&mut self, jd: f64, id: &str) -> Result<()> {
    self.allow(b'E')?;
    if !time::julian_in_range(jd) {
      return Err(SiltError::range(format!("julian day {jd} out of range")));
    }
    self.e = Some((jd, id.to_string()));
    Ok(())
  }

  pub fn set_attachment(&mut self, card: ACard) -> Result<()> {
    self.allow(b'A')?;
    self.a = Some(card);
    Ok(())
  }

  pub fn set_forum_root(&mut self, g: &str) -> Result<()> {
    self.allow(b'G')?;
    self.g = Some(g.to_string());
    Ok(())
  }

  pub fn set_forum_title(&mut self, h: &str) -> Result<()> {
    self.allow(b'H')?;
    self.h = Some(h.to_string());
    Ok(())
  }

  pub fn set_forum_reply_to(&mut self, i: &str) -> Result<()> {
    self.allow(b'I')?;
    self.i = Some(i.to_string());
    Ok(())
  }

  // ==========================================================================
  // Multi-value card adders
  // ==========================================================================

  pub fn add_fcard(&mut self, card: FCard) -> Result<()> {
    self.allow(b'F')?;
    self.mutable()?;
    if !crate::util::path::is_simple_pathname(&card.name) {
      return Err(SiltError::misuse(format!(
        "not a simple pathname: {:?}",
        card.name
      )));
    }
    if card.uuid.is_none() && self.b.is_none() {
      return Err(SiltError::misuse(
        "an F-card without a hash is only legal in a delta manifest",
      ));
    }
    self.f.push(card);
    Ok(())
  }

  /// Insert, replace or (with `uuid=None`) remove an F-card by name.
  /// Only legal before the deck has been saved.
  pub fn fcard_set(
    &mut self,
    name: &str,
    uuid: Option<&str>,
    perm: FilePerm,
    prior_name: Option<&str>,
  ) -> Result<()> {
    self.allow(b'F')?;
    self.mutable()?;
    let at = self.f.iter().position(|fc| fc.name == name);
    match (uuid, at) {
      (None, Some(idx)) => {
        self.f.remove(idx);
        Ok(())
      }
      (None, None) => Ok(()),
      (Some(u), Some(idx)) => {
        self.f[idx] = FCard {
          name: name.to_string(),
          uuid: Some(u.to_string()),
          perm,
          prior_name: prior_name.map(String::from),
        };
        Ok(())
      }
      (Some(u), None) => self.add_fcard(FCard {
        name: name.to_string(),
        uuid: Some(u.to_string()),
        perm,
        prior_name: prior_name.map(String::from),
      }),
    }
  }

  pub fn add_parent(&mut self, uuid: &str) -> Result<()> {
    self.allow(b'P')?;
    self.p.push(uuid.to_string());
    Ok(())
  }

  pub fn add_cluster_member(&mut self, uuid: &str) -> Result<()> {
    self.allow(b'M')?;
    self.m.push(uuid.to_string());
    Ok(())
  }

  pub fn add_q(&mut self, target: &str, is_backout: bool) -> Result<()> {
    self.allow(b'Q')?;
    self.q.push(QCard {
      target: target.to_string(),
      is_backout,
    });
    Ok(())
  }

  pub fn add_j(&mut self, field: &str, value: Option<&str>, append: bool) -> Result<()> {
    self.allow(b'J')?;
    self.j.push(JCard {
      field: field.to_string(),
      value: value.map(String::from),
      append,
    });
    Ok(())
  }

  /// Add a T-card. `uuid=None` tags the containing artifact.
  pub fn add_tag(
    &mut self,
    tag_type: TagType,
    name: &str,
    uuid: Option<&str>,
    value: Option<&str>,
  ) -> Result<()> {
    self.allow(b'T')?;
    if !is_valid_tag_name(name) {
      return Err(SiltError::misuse(format!("invalid tag name: {name:?}")));
    }
    self.t.push(TCard {
      tag_type,
      name: name.to_string(),
      uuid: uuid.map(String::from),
      value: value.map(String::from),
    });
    Ok(())
  }

  /// Branch naming: propagating `sym-<name>` plus propagating
  /// `branch=<name>`, both on the containing artifact.
  pub fn add_branch(&mut self, name: &str) -> Result<()> {
    self.add_tag(TagType::Propagating, "branch", None, Some(name))?;
    self.add_tag(TagType::Propagating, &format!("sym-{name}"), None, None)
  }

  // ==========================================================================
  // Ordering
  // ==========================================================================

  /// Stably sort the sortable multi-value cards. P is never sorted: its
  /// order distinguishes the primary parent from merge parents.
  pub fn unshuffle(&mut self) {
    self.f.sort_by(|a, b| a.name.cmp(&b.name));
    self.m.sort();
    self.q.sort_by(|a, b| a.target.cmp(&b.target));
    self
      .t
      .sort_by(|a, b| (&a.name, &a.uuid).cmp(&(&b.name, &b.uuid)));
    self.j.sort_by(|a, b| a.field.cmp(&b.field));
  }

  /// Canonical byte form, Z-card included. The deck should be unshuffled
  /// first.
  pub fn output_bytes(&self) -> Result<Vec<u8>> {
    output::serialize(self)
  }

  // ==========================================================================
  // Delta manifests
  // ==========================================================================

  /// Is this a delta manifest (B-card present)?
  pub fn is_delta_manifest(&self) -> bool {
    self.b.is_some()
  }

  /// Load the baseline deck named by the B-card, if not already loaded.
  /// The baseline must itself be a baseline.
  pub fn load_baseline(&mut self, f: &mut Fossil) -> Result<()> {
    if self.baseline.is_some() {
      return Ok(());
    }
    let Some(buuid) = self.b.clone() else {
      return Ok(());
    };
    let rid = crate::blob::uuid_to_rid(f, &buuid)?.ok_or_else(|| {
      SiltError::new(
        ErrorKind::Phantom,
        format!("baseline {buuid} is not present in this repository"),
      )
    })?;
    let base = load(f, rid, SaType::Checkin)?;
    if base.is_delta_manifest() {
      return Err(SiltError::consistency(format!(
        "baseline {buuid} is itself a delta manifest"
      )));
    }
    self.baseline = Some(Box::new(base));
    Ok(())
  }

  pub fn baseline(&self) -> Option<&Deck> {
    self.baseline.as_deref()
  }

  /// Effective F-card view: for a baseline manifest, its own list; for a
  /// delta manifest, the baseline list overridden by additions,
  /// replacements and deletions. Yields name-sorted entries, deletions
  /// suppressed. The baseline must be loaded first; both lists must be
  /// unshuffled.
  pub fn fcards_effective(&self) -> Result<Vec<&FCard>> {
    if !self.is_delta_manifest() {
      return Ok(self.f.iter().collect());
    }
    let base = self.baseline.as_deref().ok_or_else(|| {
      SiltError::misuse("delta-manifest F iteration requires a loaded baseline")
    })?;
    let mut out: Vec<&FCard> = Vec::with_capacity(base.f.len() + self.f.len());
    let mut bi = 0;
    let mut di = 0;
    while bi < base.f.len() || di < self.f.len() {
      let pick_delta = match (base.f.get(bi), self.f.get(di)) {
        (Some(b), Some(d)) => match b.name.cmp(&d.name) {
          std::cmp::Ordering::Less => false,
          std::cmp::Ordering::Greater => true,
          std::cmp::Ordering::Equal => {
            bi += 1; // replaced (or deleted) by the delta entry
            true
          }
        },
        (Some(_), None) => false,
        (None, Some(_)) => true,
        (None, None) => unreachable!(),
      };
      if pick_delta {
        let d = &self.f[di];
        di += 1;
        if d.uuid.is_some() {
          out.push(d);
        }
      } else {
        out.push(&base.f[bi]);
        bi += 1;
      }
    }
    Ok(out)
  }

  // ==========================================================================
  // Derivation
  // ==========================================================================

  /// Turn a loaded checkin into a template for its child: the old uuid
  /// becomes the primary parent, any baseline is folded into a fresh
  /// self-contained F list, and identity/date are cleared.
  pub fn derive(&mut self, f: &mut Fossil) -> Result<()> {
    if self.satype() != SaType::Checkin {
      return Err(SiltError::type_error("only checkins can be derived"));
    }
    let old_uuid = self.uuid.take().ok_or_else(|| {
      SiltError::misuse("derive requires a deck that has been loaded or saved")
    })?;
    if self.is_delta_manifest() {
      self.load_baseline(f)?;
      let folded: Vec<FCard> = self.fcards_effective()?.into_iter().cloned().collect();
      self.f = folded;
      self.b = None;
      self.baseline = None;
    }
    self.rid = 0;
    self.p.clear();
    self.p.push(old_uuid);
    self.d = None;
    self.r = None;
    self.t.clear();
    self.q.clear();
    self.c = None;
    Ok(())
  }
}

// ============================================================================
// Load & save
// ============================================================================

/// Load and parse the artifact stored at `rid`.
pub fn load(f: &mut Fossil, rid: i64, expect: SaType) -> Result<Deck> {
  let bytes = crate::blob::content_get(f, rid)?;
  let mut d = parse(&bytes, expect)?;
  d.rid = rid;
  d.uuid = crate::blob::rid_to_uuid(f, rid)?;
  Ok(d)
}

/// Load by symbol.
pub fn load_sym(f: &mut Fossil, sym: &str, expect: SaType) -> Result<Deck> {
  let filter = match expect {
    SaType::Any => crate::resolver::SymFilter::Any,
    SaType::Checkin => crate::resolver::SymFilter::Checkin,
    other => crate::resolver::SymFilter::EventType(other.event_type().unwrap_or("*")),
  };
  let rid = crate::resolver::sym_to_rid(f, sym, filter)?;
  load(f, rid, expect)
}

/// Compute the R-card: MD5 over `name\0content\0` for each F-card in
/// sorted order.
fn compute_r_card(f: &mut Fossil, deck: &Deck) -> Result<String> {
  let mut cards: Vec<&FCard> = deck.f.iter().collect();
  cards.sort_by(|a, b| a.name.cmp(&b.name));
  let mut h = crate::hash::Hasher::md5();
  for fc in cards {
    let Some(uuid) = &fc.uuid else { continue };
    let rid = crate::blob::uuid_to_rid(f, uuid)?.ok_or_else(|| {
      SiltError::new(ErrorKind::Phantom, format!("file content {uuid} not present"))
    })?;
    let content = crate::blob::content_get(f, rid)?;
    h.update(fc.name.as_bytes());
    h.update(&[0]);
    h.update(&content);
    h.update(&[0]);
  }
  Ok(h.finalize_hex())
}

/// Serialize, store and crosslink a deck. On success the deck is sealed
/// with its new rid and uuid.
pub fn save(f: &mut Fossil, deck: &mut Deck, private: bool) -> Result<Saved> {
  if deck.satype() == SaType::Any {
    return Err(SiltError::type_error("cannot save an untyped deck"));
  }
  if deck.rid != 0 {
    return Err(SiltError::misuse("deck has already been saved"));
  }
  if deck.u.is_none() && deck.satype().allows(b'U') {
    if let Some(u) = f.user() {
      deck.u = Some(u.to_string());
    }
  }

  // A repository may refuse delta manifests outright.
  if deck.is_delta_manifest() && crate::repo::config_get_bool(f, "forbid-delta-manifests")? {
    deck.load_baseline(f)?;
    deck.f = deck.fcards_effective()?.into_iter().cloned().collect();
    deck.b = None;
    deck.baseline = None;
  }

  if deck.satype() == SaType::Checkin && deck.r.is_none() && f.config.calc_r_card {
    let md5 = if deck.f.is_empty() {
      crate::constants::MD5_EMPTY_HEX.to_string()
    } else if deck.is_delta_manifest() {
      // R covers the effective file set; fold it first.
      deck.load_baseline(f)?;
      let folded: Vec<FCard> = deck.fcards_effective()?.into_iter().cloned().collect();
      let mut probe = Deck::new(SaType::Checkin);
      probe.f = folded;
      compute_r_card(f, &probe)?
    } else {
      compute_r_card(f, deck)?
    };
    deck.r = Some(md5);
  }

  // A checkin with no F-cards needs the empty R to stay distinguishable
  // from a control artifact.
  if deck.satype() == SaType::Checkin
    && deck.f.is_empty()
    && deck.b.is_none()
    && deck.r.is_none()
    && deck.q.is_empty()
  {
    deck.r = Some(crate::constants::MD5_EMPTY_HEX.to_string());
  }

  deck.unshuffle();
  let bytes = output::serialize(deck)?;

  f.begin()?;
  let rc = (|| -> Result<Saved> {
    let saved = crate::blob::content_put_ex(
      f,
      &bytes,
      &crate::blob::PutOpts {
        private,
        ..Default::default()
      },
    )?;
    deck.rid = saved.rid;
    deck.uuid = Some(saved.uuid.clone());
    // Store the parent as a delta of its child: the newest version stays
    // a baseline.
    if let Some(parent_uuid) = deck.p.first() {
      if let Some(parent_rid) = crate::blob::uuid_to_rid(f, parent_uuid)? {
        crate::blob::content_deltify(f, parent_rid, saved.rid, false)?;
      }
    }
    crate::xlink::crosslink_deck(f, deck)?;
    Ok(saved)
  })();
  match rc {
    Ok(saved) => {
      f.end(true)?;
      debug!(rid = saved.rid, uuid = %saved.uuid, satype = deck.satype().label(), "deck saved");
      Ok(saved)
    }
    Err(e) => {
      deck.rid = 0;
      deck.uuid = None;
      f.end(false)?;
      Err(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_card_legality_by_type() {
    let mut wiki = Deck::new(SaType::Wiki);
    assert!(wiki.set_comment("nope").is_err());
    assert!(wiki.set_wiki_title("A Page").is_ok());
    let mut cluster = Deck::new(SaType::Cluster);
    assert_eq!(
      cluster.set_user("u").unwrap_err().kind(),
      ErrorKind::Type
    );
    assert!(cluster.add_cluster_member(&"a".repeat(64)).is_ok());
  }

  #[test]
  fn test_fcard_requires_simple_path() {
    let mut d = Deck::new(SaType::Checkin);
    assert!(d.add_fcard(FCard::new("ok/name.txt", "b".repeat(40))).is_ok());
    assert!(d.add_fcard(FCard::new("../breakout", "b".repeat(40))).is_err());
    assert!(d.add_fcard(FCard::new("a/.fslckout", "b".repeat(40))).is_err());
  }

  #[test]
  fn test_fcard_set_insert_replace_remove() {
    let mut d = Deck::new(SaType::Checkin);
    let u1 = "1".repeat(40);
    let u2 = "2".repeat(40);
    d.fcard_set("x.txt", Some(&u1), FilePerm::Regular, None).unwrap();
    d.fcard_set("x.txt", Some(&u2), FilePerm::Exe, None).unwrap();
    assert_eq!(d.f.len(), 1);
    assert_eq!(d.f[0].uuid.as_deref(), Some(u2.as_str()));
    assert_eq!(d.f[0].perm, FilePerm::Exe);
    d.fcard_set("x.txt", None, FilePerm::Regular, None).unwrap();
    assert!(d.f.is_empty());
  }

  #[test]
  fn test_unshuffle_sorts_everything_but_p() {
    let mut d = Deck::new(SaType::Checkin);
    d.add_fcard(FCard::new("zz", "a".repeat(40))).unwrap();
    d.add_fcard(FCard::new("aa", "b".repeat(40))).unwrap();
    d.add_parent(&"9".repeat(40)).unwrap();
    d.add_parent(&"1".repeat(40)).unwrap();
    d.unshuffle();
    assert_eq!(d.f[0].name, "aa");
    // P retains insertion order: the primary parent stays first.
    assert_eq!(d.p[0], "9".repeat(40));
  }

  #[test]
  fn test_delta_fcard_merge() {
    let mut base = Deck::new(SaType::Checkin);
    for (n, u) in [("a", "1"), ("b", "2"), ("d", "4")] {
      base.add_fcard(FCard::new(n, u.repeat(40))).unwrap();
    }
    base.unshuffle();
    let mut delta = Deck::new(SaType::Checkin);
    delta.set_baseline_uuid(&"f".repeat(40)).unwrap();
    // replace b, delete d, add c
    delta.add_fcard(FCard::new("b", "9".repeat(40))).unwrap();
    delta
      .add_fcard(FCard {
        name: "d".into(),
        uuid: None,
        perm: FilePerm::Regular,
        prior_name: None,
      })
      .unwrap();
    delta.add_fcard(FCard::new("c", "3".repeat(40))).unwrap();
    delta.unshuffle();
    delta.baseline = Some(Box::new(base));
    let eff = delta.fcards_effective().unwrap();
    let names: Vec<&str> = eff.iter().map(|fc| fc.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "c"]);
    assert_eq!(eff[1].uuid.as_deref(), Some("9".repeat(40).as_str()));
  }

  #[test]
  fn test_tag_name_validation() {
    let mut d = Deck::new(SaType::Control);
    assert!(d
      .add_tag(TagType::Add, "release-1.0", Some(&"a".repeat(40)), None)
      .is_ok());
    assert!(d
      .add_tag(TagType::Add, "bad tag", Some(&"a".repeat(40)), None)
      .is_err());
  }
}
