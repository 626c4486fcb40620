//! The crosslinker: translating parsed artifacts into the derived
//! relational tables (`event`, `plink`, `mlink`, `tagxref`, `leaf`,
//! `filename`, `forumpost`).
//!
//! All crosslink work happens between [`crosslink_begin`] and
//! [`crosslink_end`], which bracket a transaction and own the temp tables
//! used for clock-skew repair and deferred work. Derived rows are written
//! with REPLACE semantics so that re-crosslinking (rebuild, dephantomize
//! cascade) stays idempotent.

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::constants::DELTA_CHAIN_LIMIT;
use crate::context::Fossil;
use crate::deck::{self, Deck, FilePerm, SaType, TagType};
use crate::error::{ErrorKind, Result, SiltError};

/// Event-mtime nudge applied when a child claims a time at or before its
/// parent: a bit under one second in Julian days.
const TIME_FUDGE_EPSILON: f64 = 1.0 / 86400.0 * 0.9;

// ============================================================================
// Bracketing
// ============================================================================

/// Open a crosslink pass: begins a transaction and installs the scratch
/// temp tables. Must be matched by [`crosslink_end`].
pub fn crosslink_begin(f: &mut Fossil) -> Result<()> {
  if f.cache.xlink_open {
    return Err(SiltError::misuse("crosslink pass is already open"));
  }
  f.begin()?;
  f.db().exec_script(
    "CREATE TEMP TABLE IF NOT EXISTS xlink_time_fudge(
       mid INTEGER PRIMARY KEY, m1 REAL, m2 REAL);
     CREATE TEMP TABLE IF NOT EXISTS xlink_pending(
       rid INTEGER PRIMARY KEY, satype TEXT);",
  )?;
  f.cache.xlink_open = true;
  Ok(())
}

/// Close a crosslink pass: run the finalization queries and end the
/// transaction (commit or rollback).
pub fn crosslink_end(f: &mut Fossil, commit: bool) -> Result<()> {
  if !f.cache.xlink_open {
    return Err(SiltError::misuse("crosslink_end without crosslink_begin"));
  }
  f.cache.xlink_open = false;
  if commit {
    let rc = (|| -> Result<()> {
      f.db().exec(
        "UPDATE repo.event
            SET mtime=(SELECT m2 FROM temp.xlink_time_fudge WHERE mid=objid)
          WHERE objid IN (SELECT mid FROM temp.xlink_time_fudge)",
        [],
      )?;
      // Re-run anything a dephantomization queued during the pass.
      let pending: Vec<i64> = {
        let mut rows = Vec::new();
        f.db().each("SELECT rid FROM temp.xlink_pending", [], |r| {
          rows.push(r.get::<_, i64>(0)?);
          Ok(())
        })?;
        rows
      };
      f.db().exec("DELETE FROM temp.xlink_pending", [])?;
      for rid in pending {
        crosslink_rid(f, rid)?;
      }
      f.db().exec("DELETE FROM temp.xlink_time_fudge", [])?;
      Ok(())
    })();
    if let Err(e) = rc {
      f.end(false)?;
      return Err(e);
    }
  } else {
    f.db().exec("DELETE FROM temp.xlink_time_fudge", []).ok();
    f.db().exec("DELETE FROM temp.xlink_pending", []).ok();
  }
  f.end(commit)
}

// ============================================================================
// Tag interning & application
// ============================================================================

/// Intern a tag name, creating the `tag` row on first use.
pub fn tag_id(f: &Fossil, name: &str, create: bool) -> Result<Option<i64>> {
  if let Some(id) = f
    .db()
    .one_i64("SELECT tagid FROM repo.tag WHERE tagname=?1", [name])?
  {
    return Ok(Some(id));
  }
  if !create {
    return Ok(None);
  }
  f.db()
    .exec("INSERT INTO repo.tag(tagname) VALUES (?1)", [name])?;
  Ok(Some(f.db().conn().last_insert_rowid()))
}

/// Apply one tag mutation to `rid`. Precedence is by mtime: an arriving
/// row older than the recorded one is a no-op. Propagating tags walk the
/// primary-child closure until a newer same-tag row overrides them.
#[allow(clippy::too_many_arguments)]
pub fn tag_insert(
  f: &mut Fossil,
  tag_type: TagType,
  name: &str,
  value: Option<&str>,
  srcid: i64,
  mtime: f64,
  rid: i64,
) -> Result<()> {
  let tagid = tag_id(f, name, true)?.expect("tag row was just created");
  let existing = f.db().one_f64(
    "SELECT mtime FROM repo.tagxref WHERE rid=?1 AND tagid=?2",
    [rid, tagid],
  )?;
  if let Some(old) = existing {
    if old > mtime {
      return Ok(()); // a newer mutation already won
    }
  }
  f.db().exec(
    "INSERT OR REPLACE INTO repo.tagxref(tagid, tagtype, srcid, origid, value, mtime, rid)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    rusqlite::params![tagid, tag_type.as_int(), srcid, rid, value, mtime, rid],
  )?;
  trace!(rid, tag = name, tagtype = tag_type.as_int(), "tag applied");
  if tag_type == TagType::Propagating || tag_type == TagType::Cancel {
    tag_propagate(f, tagid, tag_type, value, srcid, mtime, rid)?;
  }
  Ok(())
}

/// Walk primary-child links from `origin`, applying (or cancelling) a
/// propagating tag until a same-tag row newer than `mtime` stops the walk.
#[allow(clippy::too_many_arguments)]
fn tag_propagate(
  f: &mut Fossil,
  tagid: i64,
  tag_type: TagType,
  value: Option<&str>,
  srcid: i64,
  mtime: f64,
  origin: i64,
) -> Result<()> {
  let mut queue = vec![origin];
  let mut seen = HashSet::from([origin]);
  while let Some(cur) = queue.pop() {
    let children: Vec<i64> = {
      let mut rows = Vec::new();
      f.db().each(
        "SELECT cid FROM repo.plink WHERE pid=?1 AND isprim",
        [cur],
        |r| {
          rows.push(r.get::<_, i64>(0)?);
          Ok(())
        },
      )?;
      rows
    };
    for child in children {
      if !seen.insert(child) {
        continue;
      }
      let existing: Option<(f64, i64)> = {
        let mut row = None;
        f.db().each(
          "SELECT mtime, srcid FROM repo.tagxref WHERE rid=?1 AND tagid=?2",
          [child, tagid],
          |r| {
            row = Some((r.get::<_, f64>(0)?, r.get::<_, i64>(1)?));
            Ok(())
          },
        )?;
        row
      };
      if let Some((old_mtime, old_srcid)) = existing {
        // A direct (non-inherited) or newer assignment shuts the door.
        if old_mtime > mtime || old_srcid != srcid && old_mtime >= mtime {
          continue;
        }
      }
      match tag_type {
        TagType::Cancel => {
          f.db().exec(
            "DELETE FROM repo.tagxref WHERE rid=?1 AND tagid=?2 AND srcid<>rid",
            [child, tagid],
          )?;
        }
        _ => {
          f.db().exec(
            "INSERT OR REPLACE INTO repo.tagxref(tagid, tagtype, srcid, origid, value, mtime, rid)
             VALUES (?1, 2, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![tagid, srcid, origin, value, mtime, child],
          )?;
        }
      }
      queue.push(child);
    }
  }
  Ok(())
}

/// The branch a checkin sits on, when one is recorded.
pub fn branch_of(f: &Fossil, rid: i64) -> Result<Option<String>> {
  let Some(tagid) = tag_id(f, "branch", false)? else {
    return Ok(None);
  };
  f.db().one_text(
    "SELECT value FROM repo.tagxref WHERE rid=?1 AND tagid=?2 AND tagtype>0",
    [rid, tagid],
  )
}

// ============================================================================
// Leaf maintenance
// ============================================================================

/// Recompute `leaf` membership for one checkin: a leaf has no child on its
/// own branch.
pub fn leaf_check(f: &mut Fossil, rid: i64) -> Result<()> {
  let my_branch = branch_of(f, rid)?;
  let children: Vec<i64> = {
    let mut rows = Vec::new();
    f.db()
      .each("SELECT cid FROM repo.plink WHERE pid=?1", [rid], |r| {
        rows.push(r.get::<_, i64>(0)?);
        Ok(())
      })?;
    rows
  };
  let mut is_leaf = true;
  for child in children {
    if branch_of(f, child)? == my_branch {
      is_leaf = false;
      break;
    }
  }
  if is_leaf {
    f.db()
      .exec("INSERT OR REPLACE INTO repo.leaf(rid) VALUES (?1)", [rid])?;
  } else {
    f.db().exec("DELETE FROM repo.leaf WHERE rid=?1", [rid])?;
  }
  Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// rid for a hash, creating a phantom when the content has not arrived.
fn rid_or_phantom(f: &mut Fossil, uuid: &str) -> Result<i64> {
  match crate::blob::uuid_to_rid(f, uuid)? {
    Some(rid) => Ok(rid),
    None => crate::blob::content_new(f, uuid, false),
  }
}

/// Intern a pathname into `filename`.
fn filename_id(f: &Fossil, name: &str) -> Result<i64> {
  if let Some(id) = f
    .db()
    .one_i64("SELECT fnid FROM repo.filename WHERE name=?1", [name])?
  {
    return Ok(id);
  }
  f.db()
    .exec("INSERT INTO repo.filename(name) VALUES (?1)", [name])?;
  Ok(f.db().conn().last_insert_rowid())
}

/// Insert the event row for an artifact, nudging its mtime past any
/// parent's so the timeline stays a superset of parent order.
fn event_insert(
  f: &mut Fossil,
  etype: &str,
  mut mtime: f64,
  objid: i64,
  user: Option<&str>,
  parent_mtime: Option<f64>,
) -> Result<f64> {
  if let Some(pm) = parent_mtime {
    if mtime <= pm {
      let fudged = pm + TIME_FUDGE_EPSILON;
      f.db().exec(
        "INSERT OR REPLACE INTO temp.xlink_time_fudge(mid, m1, m2) VALUES (?1, ?2, ?3)",
        rusqlite::params![objid, mtime, fudged],
      )?;
      mtime = fudged;
    }
  }
  f.db().exec(
    "INSERT OR REPLACE INTO repo.event(type, mtime, objid, user, omtime)
     VALUES (?1, ?2, ?3, ?4, ?2)",
    rusqlite::params![etype, mtime, objid, user],
  )?;
  Ok(mtime)
}

fn perm_int(p: FilePerm) -> i64 {
  match p {
    FilePerm::Regular => 0,
    FilePerm::Exe => 1,
    FilePerm::Link => 2,
  }
}

// ============================================================================
// Per-satype crosslinking
// ============================================================================

/// Crosslink a parsed deck. Opens its own bracket when none is active.
pub fn crosslink_deck(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let own_bracket = !f.cache.xlink_open;
  if own_bracket {
    crosslink_begin(f)?;
  }
  let rc = crosslink_in_bracket(f, deck);
  if own_bracket {
    let commit = rc.is_ok();
    crosslink_end(f, commit)?;
  }
  rc
}

fn crosslink_in_bracket(f: &mut Fossil, deck: &Deck) -> Result<()> {
  if deck.rid == 0 {
    return Err(SiltError::misuse("cannot crosslink an unsaved deck"));
  }
  match deck.satype() {
    SaType::Checkin => xlink_checkin(f, deck)?,
    SaType::Control => xlink_control(f, deck)?,
    SaType::Cluster => xlink_cluster(f, deck)?,
    SaType::Wiki | SaType::Technote | SaType::Attachment => xlink_eventish(f, deck)?,
    SaType::Forumpost => xlink_forumpost(f, deck)?,
    SaType::Ticket => xlink_ticket(f, deck)?,
    SaType::Any => {
      return Err(SiltError::type_error("cannot crosslink an untyped deck"));
    }
  }
  run_listeners(f, deck)?;
  debug!(rid = deck.rid, satype = deck.satype().label(), "crosslinked");
  Ok(())
}

fn xlink_checkin(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let mid = deck.rid;
  let mtime = deck.d.unwrap_or_else(crate::util::time::julian_now);

  // Parent links; the first P is the primary parent.
  let mut parent_rids: Vec<i64> = Vec::with_capacity(deck.p.len());
  let mut parent_mtime: Option<f64> = None;
  let baseline_rid = match &deck.b {
    Some(b) => Some(rid_or_phantom(f, b)?),
    None => None,
  };
  for (i, puuid) in deck.p.iter().enumerate() {
    let prid = rid_or_phantom(f, puuid)?;
    parent_rids.push(prid);
    f.db().exec(
      "INSERT OR REPLACE INTO repo.plink(pid, cid, isprim, mtime, baseid)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      rusqlite::params![prid, mid, i == 0, mtime, baseline_rid],
    )?;
    if i == 0 {
      parent_mtime = f
        .db()
        .one_f64("SELECT mtime FROM repo.event WHERE objid=?1", [prid])?;
    }
  }

  let mtime = event_insert(f, "ci", mtime, mid, deck.u.as_deref(), parent_mtime)?;

  // File links. A delta manifest needs its baseline; when the baseline
  // has not arrived, record the orphan and leave mlink for the cascade.
  let mut deferred = false;
  if deck.is_delta_manifest() && deck.baseline().is_none() {
    let available = match baseline_rid {
      Some(rid) => crate::blob::content_is_available(f, rid)?,
      None => false,
    };
    if !available {
      f.db().exec(
        "INSERT OR REPLACE INTO repo.orphan(rid, baseline) VALUES (?1, ?2)",
        rusqlite::params![mid, baseline_rid],
      )?;
      deferred = true;
      warn!(rid = mid, "delta manifest crosslinked without its baseline");
    }
  }
  if !deferred {
    xlink_checkin_files(f, deck, mid, &parent_rids)?;
  }

  // Tags: inherit the primary parent's propagating tags, then apply the
  // artifact's own T-cards (which may override what was inherited).
  if let Some(&pp) = parent_rids.first() {
    inherit_propagating_tags(f, pp, mid, mtime)?;
  }
  for t in deck.t.clone() {
    let target = match &t.uuid {
      Some(u) => rid_or_phantom(f, u)?,
      None => mid,
    };
    tag_insert(
      f,
      t.tag_type,
      &t.name,
      t.value.as_deref(),
      mid,
      mtime,
      target,
    )?;
  }

  leaf_check(f, mid)?;
  for prid in parent_rids {
    leaf_check(f, prid)?;
  }
  Ok(())
}

/// Copy the propagating tags riding on `parent` onto `child`.
fn inherit_propagating_tags(f: &mut Fossil, parent: i64, child: i64, mtime: f64) -> Result<()> {
  let rows: Vec<(String, Option<String>, i64)> = {
    let mut out = Vec::new();
    f.db().each(
      "SELECT t.tagname, x.value, x.srcid
         FROM repo.tagxref x JOIN repo.tag t ON t.tagid=x.tagid
        WHERE x.rid=?1 AND x.tagtype=2",
      [parent],
      |r| {
        out.push((r.get(0)?, r.get(1)?, r.get(2)?));
        Ok(())
      },
    )?;
    out
  };
  for (name, value, srcid) in rows {
    tag_insert(
      f,
      TagType::Propagating,
      &name,
      value.as_deref(),
      srcid,
      mtime,
      child,
    )?;
  }
  Ok(())
}

/// Write the mlink rows for one checkin against each of its parents.
fn xlink_checkin_files(
  f: &mut Fossil,
  deck: &Deck,
  mid: i64,
  parent_rids: &[i64],
) -> Result<()> {
  // Effective file list (baseline-merged for delta manifests).
  let own: Vec<crate::deck::FCard> = {
    let mut d2;
    let source: &Deck = if deck.is_delta_manifest() && deck.baseline().is_none() {
      d2 = deck_reload(f, mid)?;
      d2.load_baseline(f)?;
      &d2
    } else {
      deck
    };
    source.fcards_effective()?.into_iter().cloned().collect()
  };

  if parent_rids.is_empty() {
    for fc in &own {
      let Some(uuid) = &fc.uuid else { continue };
      let fid = rid_or_phantom(f, uuid)?;
      let fnid = filename_id(f, &fc.name)?;
      f.db().exec(
        "INSERT INTO repo.mlink(mid, pid, fid, fnid, pfnid, mperm, isaux)
         VALUES (?1, 0, ?2, ?3, 0, ?4, 0)",
        rusqlite::params![mid, fid, fnid, perm_int(fc.perm)],
      )?;
    }
    return Ok(());
  }

  for (pi, &prid) in parent_rids.iter().enumerate() {
    let isaux = pi > 0;
    // Parent file map: name -> uuid. An unavailable parent contributes
    // nothing; its files read as additions.
    let parent_files: Vec<(String, String)> = match deck_reload(f, prid) {
      Ok(mut pd) if pd.satype() == SaType::Checkin => {
        pd.load_baseline(f).ok();
        match pd.fcards_effective() {
          Ok(list) => list
            .into_iter()
            .filter_map(|fc| fc.uuid.clone().map(|u| (fc.name.clone(), u)))
            .collect(),
          Err(_) => Vec::new(),
        }
      }
      _ => Vec::new(),
    };
    let parent_map: std::collections::HashMap<&str, &str> = parent_files
      .iter()
      .map(|(n, u)| (n.as_str(), u.as_str()))
      .collect();

    let mut seen_parent_names: HashSet<&str> = HashSet::new();
    for fc in &own {
      let Some(uuid) = &fc.uuid else { continue };
      let prior_name = fc.prior_name.as_deref().unwrap_or(&fc.name);
      let prior_uuid = parent_map.get(prior_name).copied();
      if let Some(pu) = prior_uuid {
        seen_parent_names.insert(prior_name);
        if pu == uuid.as_str() && fc.prior_name.is_none() {
          continue; // unchanged vs this parent
        }
      }
      let fid = rid_or_phantom(f, uuid)?;
      let fnid = filename_id(f, &fc.name)?;
      let pfnid = match &fc.prior_name {
        Some(pn) => filename_id(f, pn)?,
        None => 0,
      };
      let pid = match prior_uuid {
        Some(pu) => rid_or_phantom(f, pu)?,
        None => 0,
      };
      f.db().exec(
        "INSERT INTO repo.mlink(mid, pid, fid, fnid, pfnid, mperm, isaux)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![mid, pid, fid, fnid, pfnid, perm_int(fc.perm), isaux],
      )?;
    }
    // Files the parent had that the child dropped.
    let own_names: HashSet<&str> = own.iter().map(|fc| fc.name.as_str()).collect();
    for (name, uuid) in &parent_files {
      if own_names.contains(name.as_str()) || seen_parent_names.contains(name.as_str()) {
        continue;
      }
      let pid = rid_or_phantom(f, uuid)?;
      let fnid = filename_id(f, name)?;
      f.db().exec(
        "INSERT INTO repo.mlink(mid, pid, fid, fnid, pfnid, mperm, isaux)
         VALUES (?1, ?2, 0, ?3, 0, 0, ?4)",
        rusqlite::params![mid, pid, fnid, isaux],
      )?;
    }
  }
  Ok(())
}

/// Reload a deck from storage (used when crosslinking needs a parent's or
/// its own baseline-expanded view).
fn deck_reload(f: &mut Fossil, rid: i64) -> Result<Deck> {
  deck::load(f, rid, SaType::Any)
}

fn xlink_control(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let mtime = deck.d.unwrap_or_else(crate::util::time::julian_now);
  for t in deck.t.clone() {
    let target = match &t.uuid {
      Some(u) => rid_or_phantom(f, u)?,
      None => deck.rid,
    };
    tag_insert(
      f,
      t.tag_type,
      &t.name,
      t.value.as_deref(),
      deck.rid,
      mtime,
      target,
    )?;
    // Branch membership may have changed under a leaf.
    leaf_check(f, target)?;
  }
  Ok(())
}

fn xlink_cluster(f: &mut Fossil, deck: &Deck) -> Result<()> {
  // Clusters only retire their members from the unclustered set.
  for m in &deck.m {
    f.db().exec(
      "DELETE FROM repo.unclustered
        WHERE rid=(SELECT rid FROM repo.blob WHERE uuid=?1)",
      [m],
    )?;
  }
  Ok(())
}

fn xlink_eventish(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let etype = deck
    .satype()
    .event_type()
    .expect("eventish satypes map to an event type");
  let mtime = deck.d.unwrap_or_else(crate::util::time::julian_now);
  // Revision chains (wiki/technote edits) hang off P.
  let parent_mtime = match deck.p.first() {
    Some(p) => {
      let prid = rid_or_phantom(f, p)?;
      f.db()
        .one_f64("SELECT mtime FROM repo.event WHERE objid=?1", [prid])?
    }
    None => None,
  };
  event_insert(f, etype, mtime, deck.rid, deck.u.as_deref(), parent_mtime)?;
  Ok(())
}

fn xlink_forumpost(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let mtime = deck.d.unwrap_or_else(crate::util::time::julian_now);
  let froot = match &deck.g {
    Some(g) => rid_or_phantom(f, g)?,
    None => deck.rid,
  };
  let firt = match &deck.i {
    Some(i) => Some(rid_or_phantom(f, i)?),
    None => None,
  };
  let fprev = match deck.p.first() {
    Some(p) => Some(rid_or_phantom(f, p)?),
    None => None,
  };
  f.db().exec(
    "INSERT OR REPLACE INTO repo.forumpost(fpid, froot, fprev, firt, fmtime)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    rusqlite::params![deck.rid, froot, fprev, firt, mtime],
  )?;
  event_insert(f, "f", mtime, deck.rid, deck.u.as_deref(), None)?;
  Ok(())
}

fn xlink_ticket(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let mtime = deck.d.unwrap_or_else(crate::util::time::julian_now);
  event_insert(f, "t", mtime, deck.rid, deck.u.as_deref(), None)?;
  if let Some(k) = &deck.k {
    f.db().exec(
      "INSERT OR IGNORE INTO repo.ticket(tkt_uuid, tkt_mtime, tkt_ctime)
       VALUES (?1, ?2, ?2)",
      rusqlite::params![k, mtime],
    )?;
    f.db().exec(
      "UPDATE repo.ticket SET tkt_mtime=?2 WHERE tkt_uuid=?1 AND tkt_mtime<?2",
      rusqlite::params![k, mtime],
    )?;
    f.db().exec(
      "INSERT INTO repo.ticketchng(tkt_id, tkt_rid, tkt_mtime, login)
       SELECT tkt_id, ?2, ?3, ?4 FROM repo.ticket WHERE tkt_uuid=?1",
      rusqlite::params![k, deck.rid, mtime, deck.u],
    )?;
  }
  Ok(())
}

// ============================================================================
// Listeners
// ============================================================================

fn run_listeners(f: &mut Fossil, deck: &Deck) -> Result<()> {
  let mut listeners = std::mem::take(&mut f.xlink_listeners);
  let mut rc = Ok(());
  for (name, cb) in listeners.iter_mut() {
    if let Err(e) = cb(f, deck) {
      warn!(listener = %name, error = %e, "crosslink listener failed");
      rc = Err(e);
      break;
    }
  }
  // Listeners registered during dispatch would be rare; keep the original
  // registry authoritative.
  f.xlink_listeners = listeners;
  rc
}

/// Install the `fsl/<satype>/timeline` defaults that fill the
/// human-readable event columns.
pub fn register_default_listeners(f: &mut Fossil) {
  f.xlink_listen(
    "fsl/checkin/timeline",
    Box::new(|f, deck| {
      if deck.satype() != SaType::Checkin {
        return Ok(());
      }
      f.db().exec(
        "UPDATE repo.event SET comment=?2, brief=?2 WHERE objid=?1",
        rusqlite::params![deck.rid, deck.c],
      )?;
      Ok(())
    }),
  );
  f.xlink_listen(
    "fsl/wiki/timeline",
    Box::new(|f, deck| {
      if deck.satype() != SaType::Wiki {
        return Ok(());
      }
      let title = deck.l.as_deref().unwrap_or("?");
      let comment = if deck.p.is_empty() {
        format!("Added wiki page [{title}]")
      } else {
        format!("Changes to wiki page [{title}]")
      };
      f.db().exec(
        "UPDATE repo.event SET comment=?2, brief=?2 WHERE objid=?1",
        rusqlite::params![deck.rid, comment],
      )?;
      Ok(())
    }),
  );
  f.xlink_listen(
    "fsl/technote/timeline",
    Box::new(|f, deck| {
      if deck.satype() != SaType::Technote {
        return Ok(());
      }
      let first_line = deck
        .w
        .as_deref()
        .unwrap_or("")
        .lines()
        .next()
        .unwrap_or("")
        .to_string();
      f.db().exec(
        "UPDATE repo.event SET comment=?2, brief=?2 WHERE objid=?1",
        rusqlite::params![deck.rid, first_line],
      )?;
      Ok(())
    }),
  );
  f.xlink_listen(
    "fsl/forumpost/timeline",
    Box::new(|f, deck| {
      if deck.satype() != SaType::Forumpost {
        return Ok(());
      }
      let comment = deck
        .h
        .clone()
        .unwrap_or_else(|| "Reply to forum post".to_string());
      f.db().exec(
        "UPDATE repo.event SET comment=?2, brief=?2 WHERE objid=?1",
        rusqlite::params![deck.rid, comment],
      )?;
      Ok(())
    }),
  );
  f.xlink_listen(
    "fsl/attachment/timeline",
    Box::new(|f, deck| {
      if deck.satype() != SaType::Attachment {
        return Ok(());
      }
      let comment = match &deck.a {
        Some(a) => format!("Attachment [{}] on [{}]", a.name, a.target),
        None => "Attachment change".to_string(),
      };
      f.db().exec(
        "UPDATE repo.event SET comment=?2, brief=?2 WHERE objid=?1",
        rusqlite::params![deck.rid, comment],
      )?;
      Ok(())
    }),
  );
}

// ============================================================================
// Dephantomization cascade
// ============================================================================

/// After a phantom was filled with real bytes, re-crosslink whatever was
/// waiting on it: delta manifests orphaned on this baseline, and artifacts
/// whose own bytes just became reconstructible. Iterative and bounded.
pub fn after_dephantomize(f: &mut Fossil, rid: i64) -> Result<()> {
  let mut queue = vec![rid];
  let mut seen = HashSet::from([rid]);
  let mut steps = 0usize;
  while let Some(cur) = queue.pop() {
    steps += 1;
    if steps > DELTA_CHAIN_LIMIT {
      return Err(SiltError::consistency(format!(
        "dephantomization cascade from blob {rid} did not terminate"
      )));
    }
    // The newly-available blob itself may be an artifact.
    crosslink_rid(f, cur)?;

    // Delta manifests waiting on this baseline.
    let orphans: Vec<i64> = {
      let mut rows = Vec::new();
      f.db()
        .each("SELECT rid FROM repo.orphan WHERE baseline=?1", [cur], |r| {
          rows.push(r.get::<_, i64>(0)?);
          Ok(())
        })?;
      rows
    };
    for orid in orphans {
      f.db().exec("DELETE FROM repo.orphan WHERE rid=?1", [orid])?;
      if seen.insert(orid) {
        queue.push(orid);
      }
    }

    // Blobs stored as deltas against this one become readable too.
    let dependents: Vec<i64> = {
      let mut rows = Vec::new();
      f.db()
        .each("SELECT rid FROM repo.delta WHERE srcid=?1", [cur], |r| {
          rows.push(r.get::<_, i64>(0)?);
          Ok(())
        })?;
      rows
    };
    for dep in dependents {
      if seen.insert(dep) {
        queue.push(dep);
      }
    }
  }
  Ok(())
}

/// Parse-and-crosslink one blob if it looks like (and is) an artifact.
fn crosslink_rid(f: &mut Fossil, rid: i64) -> Result<()> {
  if !crate::blob::content_is_available(f, rid)? {
    return Ok(());
  }
  let bytes = crate::blob::content_get(f, rid)?;
  if !artifact_prefilter(&bytes) {
    return Ok(());
  }
  let mut deck = match deck::parse(&bytes, SaType::Any) {
    Ok(d) => d,
    Err(_) => return Ok(()), // plain content that happens to look card-ish
  };
  deck.rid = rid;
  deck.uuid = crate::blob::rid_to_uuid(f, rid)?;
  crosslink_deck(f, &deck)
}

/// Cheap test: could these bytes be an artifact? First line must start
/// with a card letter + space; the last line must be a Z card.
fn artifact_prefilter(bytes: &[u8]) -> bool {
  if bytes.len() < 40 || !bytes[0].is_ascii_uppercase() || bytes[1] != b' ' {
    return false;
  }
  if bytes[bytes.len() - 1] != b'\n' {
    return false;
  }
  // "Z <32 hex>\n" = 35 bytes
  let tail_at = bytes.len().saturating_sub(35);
  bytes[tail_at..].starts_with(b"Z ")
}

// ============================================================================
// Rebuild
// ============================================================================

/// Counters reported by [`rebuild`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildStats {
  pub blobs_seen: usize,
  pub artifacts_linked: usize,
}

/// Drop every derived table and reconstruct it from the artifact set.
/// Idempotent: running it twice yields identical derived state.
pub fn rebuild(f: &mut Fossil) -> Result<RebuildStats> {
  let mut stats = RebuildStats::default();
  crosslink_begin(f)?;
  let rc = (|| -> Result<()> {
    f.db().exec_script(
      "DELETE FROM repo.event;
       DELETE FROM repo.mlink;
       DELETE FROM repo.plink;
       DELETE FROM repo.leaf;
       DELETE FROM repo.tagxref;
       DELETE FROM repo.tag;
       DELETE FROM repo.filename;
       DELETE FROM repo.orphan;
       DELETE FROM repo.forumpost;",
    )?;
    let rids: Vec<i64> = {
      let mut rows = Vec::new();
      f.db().each(
        "SELECT rid FROM repo.blob WHERE size>=0 ORDER BY rid",
        [],
        |r| {
          rows.push(r.get::<_, i64>(0)?);
          Ok(())
        },
      )?;
      rows
    };
    for rid in rids {
      stats.blobs_seen += 1;
      let bytes = crate::blob::content_get(f, rid)?;
      if !artifact_prefilter(&bytes) {
        continue;
      }
      let mut deck = match deck::parse(&bytes, SaType::Any) {
        Ok(d) => d,
        Err(_) => continue,
      };
      deck.rid = rid;
      deck.uuid = crate::blob::rid_to_uuid(f, rid)?;
      crosslink_in_bracket(f, &deck)?;
      stats.artifacts_linked += 1;
    }
    Ok(())
  })();
  crosslink_end(f, rc.is_ok())?;
  rc?;
  debug!(
    blobs = stats.blobs_seen,
    artifacts = stats.artifacts_linked,
    "rebuild finished"
  );
  Ok(stats)
}
