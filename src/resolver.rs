//! Symbol resolution: user-supplied strings to artifact rids.
//!
//! Accepted forms: `tip`, checkout-relative `current`/`prev`/`next`,
//! `date:<iso>` or a bare ISO date, `tag:<name>` or a bare tag name,
//! `root:<sym>`, `merge-in:<sym>`, `rid:<N>`, and hash prefixes of 4 to 64
//! hex digits. Ambiguous prefixes and unknown names fail with distinct
//! error kinds.

use rusqlite::Connection;

use crate::constants::{STRLEN_SHA1, STRLEN_SHA3};
use crate::context::Fossil;
use crate::error::{ErrorKind, Result, SiltError};
use crate::hash;
use crate::util::time;

// ============================================================================
// Filters
// ============================================================================

/// Restricts which artifact kinds a symbol may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymFilter {
  Any,
  Checkin,
  /// Restrict by `event.type` tag (`"w"`, `"e"`, `"t"`, `"f"`).
  EventType(&'static str),
}

impl SymFilter {
  /// GLOB pattern over `event.type`.
  fn type_glob(self) -> &'static str {
    match self {
      SymFilter::Any => "*",
      SymFilter::Checkin => "ci",
      SymFilter::EventType(t) => t,
    }
  }
}

/// Checkout-derived context for the relative symbols.
#[derive(Debug, Clone, Copy)]
pub struct ResolveEnv {
  pub ckout_rid: i64,
  /// `""` or `" COLLATE nocase"`, spliced into tag-name comparisons.
  pub collation: &'static str,
}

// ============================================================================
// Entry points
// ============================================================================

/// Resolve against the full context (checkout symbols and collation
/// included).
pub fn sym_to_rid(f: &Fossil, sym: &str, filter: SymFilter) -> Result<i64> {
  let env = ResolveEnv {
    ckout_rid: f.ckout().map(|c| c.rid).unwrap_or(0),
    collation: f.db().filename_collation(),
  };
  sym_to_rid_raw(f.db().conn(), sym, filter, Some(&env))
}

/// Resolve and return the rid together with its full hash.
pub fn sym_to_uuid(f: &Fossil, sym: &str, filter: SymFilter) -> Result<(i64, String)> {
  let rid = sym_to_rid(f, sym, filter)?;
  let uuid = f
    .db()
    .one_text("SELECT uuid FROM repo.blob WHERE rid=?1", [rid])?
    .ok_or_else(|| SiltError::consistency(format!("rid {rid} has no blob row")))?;
  Ok((rid, uuid))
}

/// Does this rid name a checkin?
pub fn rid_is_a_checkin(f: &Fossil, rid: i64) -> Result<bool> {
  Ok(
    f.db()
      .one_i64(
        "SELECT 1 FROM repo.event WHERE objid=?1 AND type='ci'",
        [rid],
      )?
      .is_some(),
  )
}

/// Connection-level resolver, usable from SQL functions. Checkout-relative
/// symbols require `env`.
pub fn sym_to_rid_raw(
  conn: &Connection,
  sym: &str,
  filter: SymFilter,
  env: Option<&ResolveEnv>,
) -> Result<i64> {
  let sym = sym.trim();
  if sym.is_empty() {
    return Err(SiltError::misuse("empty symbol"));
  }
  let collation = env.map(|e| e.collation).unwrap_or("");

  // tip: the newest checkin on the timeline.
  if sym == "tip" && matches!(filter, SymFilter::Any | SymFilter::Checkin) {
    return one_i64(
      conn,
      "SELECT objid FROM repo.event WHERE type='ci' ORDER BY mtime DESC LIMIT 1",
      [],
    )?
    .ok_or_else(|| SiltError::not_found("repository has no checkins"));
  }

  // Checkout-relative symbols.
  if matches!(sym, "current" | "prev" | "previous" | "next") {
    let ckrid = env.map(|e| e.ckout_rid).unwrap_or(0);
    if ckrid == 0 {
      return Err(SiltError::new(
        ErrorKind::NotACkout,
        format!("symbol {sym:?} requires an opened checkout"),
      ));
    }
    return match sym {
      "current" => Ok(ckrid),
      "prev" | "previous" => one_i64(
        conn,
        "SELECT pid FROM repo.plink WHERE cid=?1 AND isprim",
        [ckrid],
      )?
      .ok_or_else(|| SiltError::not_found("checkout version has no primary parent")),
      _ => one_i64(
        conn,
        "SELECT cid FROM repo.plink WHERE pid=?1 AND isprim ORDER BY mtime LIMIT 1",
        [ckrid],
      )?
      .ok_or_else(|| SiltError::not_found("checkout version has no child")),
    };
  }

  // Dates, explicit or bare.
  let date_part = sym.strip_prefix("date:").or_else(|| {
    let b = sym.as_bytes();
    (b.len() >= 10 && b[4] == b'-' && b[..4].iter().all(u8::is_ascii_digit)).then_some(sym)
  });
  if let Some(ds) = date_part {
    let jd = time::iso8601_to_julian(ds)?;
    return one_i64(
      conn,
      "SELECT objid FROM repo.event
        WHERE mtime<=?1 AND (?2='*' OR type GLOB ?2)
        ORDER BY mtime DESC LIMIT 1",
      rusqlite::params![jd, filter.type_glob()],
    )?
    .ok_or_else(|| SiltError::not_found(format!("nothing on the timeline at or before {ds}")));
  }

  if let Some(tag) = sym.strip_prefix("tag:") {
    return tag_to_rid(conn, tag, filter, collation)?
      .ok_or_else(|| SiltError::not_found(format!("no artifact carries tag {tag:?}")));
  }

  if let Some(inner) = sym.strip_prefix("root:") {
    let rid = sym_to_rid_raw(conn, inner, SymFilter::Checkin, env)?;
    return branch_origin(conn, rid);
  }

  if let Some(inner) = sym.strip_prefix("merge-in:") {
    let rid = sym_to_rid_raw(conn, inner, SymFilter::Checkin, env)?;
    return merge_in_point(conn, rid);
  }

  if let Some(n) = sym.strip_prefix("rid:") {
    let rid: i64 = n
      .parse()
      .map_err(|_| SiltError::misuse(format!("malformed rid symbol: {sym:?}")))?;
    let exists = one_i64(conn, "SELECT 1 FROM repo.blob WHERE rid=?1", [rid])?.is_some();
    if !exists {
      return Err(SiltError::not_found(format!("no blob with rid {rid}")));
    }
    if !rid_matches_filter(conn, rid, filter)? {
      return Err(SiltError::new(
        ErrorKind::NotFound,
        format!("rid {rid} is not of the requested artifact type"),
      ));
    }
    return Ok(rid);
  }

  // A bare tag name wins over a hash prefix when both could apply.
  if let Some(rid) = tag_to_rid(conn, sym, filter, collation)? {
    return Ok(rid);
  }

  if hash::is_uuid_prefix(sym) {
    return prefix_to_rid(conn, &sym.to_ascii_lowercase(), filter);
  }

  Err(SiltError::new(
    ErrorKind::UnknownResource,
    format!("unresolvable symbol: {sym:?}"),
  ))
}

// ============================================================================
// Lookup plans
// ============================================================================

fn one_i64<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Option<i64>> {
  let mut stmt = conn.prepare(sql)?;
  let mut rows = stmt.query(params)?;
  match rows.next()? {
    Some(row) => Ok(Some(row.get(0)?)),
    None => Ok(None),
  }
}

/// Two-phase tag lookup: scan the 30 most recent events first, then fall
/// back to the tagxref index.
fn tag_to_rid(
  conn: &Connection,
  tag: &str,
  filter: SymFilter,
  collation: &str,
) -> Result<Option<i64>> {
  let sym_tag = format!("sym-{tag}");
  let recent_sql = format!(
    "SELECT e.objid FROM (
       SELECT objid, type, mtime FROM repo.event ORDER BY mtime DESC LIMIT 30
     ) e
     WHERE (?2='*' OR e.type GLOB ?2)
       AND EXISTS (
         SELECT 1 FROM repo.tagxref x JOIN repo.tag t ON t.tagid=x.tagid
          WHERE x.rid=e.objid AND x.tagtype>0 AND t.tagname=?1{collation})
     ORDER BY e.mtime DESC LIMIT 1"
  );
  if let Some(rid) = one_i64(
    conn,
    &recent_sql,
    rusqlite::params![sym_tag, filter.type_glob()],
  )? {
    return Ok(Some(rid));
  }
  let indexed_sql = format!(
    "SELECT x.rid FROM repo.tagxref x
       JOIN repo.tag t ON t.tagid=x.tagid
       JOIN repo.event e ON e.objid=x.rid
      WHERE t.tagname=?1{collation} AND x.tagtype>0
        AND (?2='*' OR e.type GLOB ?2)
      ORDER BY e.mtime DESC LIMIT 1"
  );
  one_i64(
    conn,
    &indexed_sql,
    rusqlite::params![sym_tag, filter.type_glob()],
  )
}

/// Hash-prefix resolution. Full-length hashes take the unique index; a
/// shorter prefix scans and must match exactly one blob.
fn prefix_to_rid(conn: &Connection, prefix: &str, filter: SymFilter) -> Result<i64> {
  if prefix.len() == STRLEN_SHA1 || prefix.len() == STRLEN_SHA3 {
    if let Some(rid) = one_i64(conn, "SELECT rid FROM repo.blob WHERE uuid=?1", [prefix])? {
      if rid_matches_filter(conn, rid, filter)? {
        return Ok(rid);
      }
    }
    return Err(SiltError::not_found(format!("no blob named {prefix}")));
  }
  let mut stmt = conn.prepare(
    "SELECT rid, uuid FROM repo.blob WHERE uuid GLOB ?1 || '*' ORDER BY uuid LIMIT 3",
  )?;
  let mut rows = stmt.query([prefix])?;
  let mut matches: Vec<(i64, String)> = Vec::new();
  while let Some(row) = rows.next()? {
    matches.push((row.get(0)?, row.get(1)?));
  }
  match matches.len() {
    0 => Err(SiltError::not_found(format!(
      "no blob hash starts with {prefix}"
    ))),
    1 => {
      let (rid, _) = &matches[0];
      if rid_matches_filter(conn, *rid, filter)? {
        Ok(*rid)
      } else {
        Err(SiltError::not_found(format!(
          "prefix {prefix} names an artifact of another type"
        )))
      }
    }
    _ => Err(SiltError::new(
      ErrorKind::Ambiguous,
      format!(
        "prefix {prefix} is ambiguous: {} vs {}{}",
        matches[0].1,
        matches[1].1,
        if matches.len() > 2 { " (and more)" } else { "" }
      ),
    )),
  }
}

fn rid_matches_filter(conn: &Connection, rid: i64, filter: SymFilter) -> Result<bool> {
  let glob = filter.type_glob();
  if glob == "*" {
    return Ok(true);
  }
  Ok(
    one_i64(
      conn,
      "SELECT 1 FROM repo.event WHERE objid=?1 AND type GLOB ?2",
      rusqlite::params![rid, glob],
    )?
    .is_some(),
  )
}

// ============================================================================
// Branch topology
// ============================================================================

fn branch_name(conn: &Connection, rid: i64) -> Result<Option<String>> {
  let mut stmt = conn.prepare(
    "SELECT x.value FROM repo.tagxref x JOIN repo.tag t ON t.tagid=x.tagid
      WHERE x.rid=?1 AND t.tagname='branch' AND x.tagtype>0",
  )?;
  let mut rows = stmt.query([rid])?;
  match rows.next()? {
    Some(row) => Ok(row.get(0)?),
    None => Ok(None),
  }
}

/// `root:` — the nearest ancestor that sits on the parent branch.
fn branch_origin(conn: &Connection, rid: i64) -> Result<i64> {
  let my_branch = branch_name(conn, rid)?;
  let mut cursor = rid;
  let mut hops = 0usize;
  loop {
    hops += 1;
    if hops > crate::constants::DELTA_CHAIN_LIMIT {
      return Err(SiltError::consistency(format!(
        "parent chain from rid {rid} does not terminate"
      )));
    }
    let parent = one_i64(
      conn,
      "SELECT pid FROM repo.plink WHERE cid=?1 AND isprim",
      [cursor],
    )?;
    let Some(parent) = parent else {
      return Err(SiltError::not_found(format!(
        "rid {rid} has no ancestor on another branch"
      )));
    };
    if branch_name(conn, parent)? != my_branch {
      return Ok(parent);
    }
    cursor = parent;
  }
}

/// `merge-in:` — the youngest ancestor on the branch this one diverged
/// from.
fn merge_in_point(conn: &Connection, rid: i64) -> Result<i64> {
  let origin = branch_origin(conn, rid)?;
  let parent_branch = branch_name(conn, origin)?;
  // Walk all ancestors, keeping the newest one on the parent branch.
  let mut best: Option<(i64, f64)> = None;
  let mut queue = vec![rid];
  let mut seen = std::collections::HashSet::from([rid]);
  while let Some(cur) = queue.pop() {
    let mut stmt = conn.prepare("SELECT pid, mtime FROM repo.plink WHERE cid=?1")?;
    let mut rows = stmt.query([cur])?;
    let mut parents: Vec<(i64, f64)> = Vec::new();
    while let Some(row) = rows.next()? {
      parents.push((row.get(0)?, row.get(1)?));
    }
    for (pid, mtime) in parents {
      if !seen.insert(pid) {
        continue;
      }
      if branch_name(conn, pid)? == parent_branch {
        if best.map(|(_, m)| mtime > m).unwrap_or(true) {
          best = Some((pid, mtime));
        }
        continue; // do not walk past the merge-in point
      }
      queue.push(pid);
    }
  }
  best
    .map(|(rid, _)| rid)
    .ok_or_else(|| SiltError::not_found(format!("rid {rid} has no merge-in ancestor")))
}
