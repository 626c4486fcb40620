//! Checkout materialization: full extract of a version, and the three-way
//! update that carries local edits onto a new target.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::context::{ConfirmEvent, ConfirmEventId, ConfirmMemo, ConfirmResponse, Fossil};
use crate::deck::{FilePerm, SaType};
use crate::error::{ErrorKind, Result, SiltError};
use crate::hash::HashAlgo;
use crate::merge3;

use super::{
  changes_scan, fingerprint_write, manifest_files_write, remove_and_prune, stat_file, vfile_load,
  vfile_rows, vfile_unload_except, write_managed_file, ChangeState, ScanFlags, VFileEntry,
};

// ============================================================================
// Reported change types
// ============================================================================

/// Per-file outcome reported through the checkout/update callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeType {
  None,
  Added,
  AddPropagated,
  Rm,
  RmPropagated,
  Updated,
  UpdatedBinary,
  Merged,
  ConflictMerged,
  ConflictAdded,
  ConflictAddedUnmanaged,
  ConflictRm,
  ConflictSymlink,
  Renamed,
}

pub type ChangeCallback<'a> = &'a mut dyn FnMut(&str, FileChangeType) -> Result<()>;

fn notify(
  cb: &mut Option<ChangeCallback<'_>>,
  name: &str,
  change: FileChangeType,
) -> Result<()> {
  match cb.as_mut() {
    Some(cb) => cb(name, change),
    None => Ok(()),
  }
}

// ============================================================================
// Target file lists
// ============================================================================

#[derive(Debug, Clone)]
struct TargetFile {
  name: String,
  uuid: String,
  rid: i64,
  perm: FilePerm,
  prior_name: Option<String>,
}

fn target_files(f: &mut Fossil, tid: i64) -> Result<Vec<TargetFile>> {
  let mut deck = crate::deck::load(f, tid, SaType::Checkin)?;
  deck.load_baseline(f)?;
  let cards: Vec<(String, String, FilePerm, Option<String>)> = deck
    .fcards_effective()?
    .into_iter()
    .filter_map(|fc| {
      fc.uuid
        .clone()
        .map(|u| (fc.name.clone(), u, fc.perm, fc.prior_name.clone()))
    })
    .collect();
  let mut out = Vec::with_capacity(cards.len());
  for (name, uuid, perm, prior_name) in cards {
    let rid = match crate::blob::uuid_to_rid(f, &uuid)? {
      Some(rid) => rid,
      None => crate::blob::content_new(f, &uuid, false)?,
    };
    out.push(TargetFile {
      name,
      uuid,
      rid,
      perm,
      prior_name,
    });
  }
  Ok(out)
}

fn write_target_file(
  f: &mut Fossil,
  root: &Path,
  tf: &TargetFile,
  dry_run: bool,
  set_mtime: bool,
  tid: i64,
) -> Result<()> {
  if dry_run {
    return Ok(());
  }
  let content = crate::blob::content_get(f, tf.rid)?;
  write_managed_file(
    &root.join(&tf.name),
    &content,
    tf.perm == FilePerm::Exe,
    tf.perm == FilePerm::Link,
  )?;
  if set_mtime {
    if let Some(mt) = super::manifest_file_mtime(f, tid, &tf.name)? {
      filetime::set_file_mtime(
        root.join(&tf.name),
        filetime::FileTime::from_unix_time(mt, 0),
      )
      .ok();
    }
  }
  Ok(())
}

// ============================================================================
// Checkout (full extract)
// ============================================================================

/// Options for [`repo_ckout`].
pub struct CkoutOpts<'a> {
  /// Target checkin rid.
  pub version: i64,
  /// Report everything, write nothing, commit nothing.
  pub dry_run: bool,
  /// Stamp extracted files with their manifest mtime.
  pub set_mtime: bool,
  pub callback: Option<ChangeCallback<'a>>,
}

impl CkoutOpts<'_> {
  pub fn new(version: i64) -> Self {
    Self {
      version,
      dry_run: false,
      set_mtime: false,
      callback: None,
    }
  }
}

/// Materialize a checkin into the checkout directory, honoring the
/// confirmer for overwrites and removals of files it does not own.
pub fn repo_ckout(f: &mut Fossil, opts: &mut CkoutOpts<'_>) -> Result<()> {
  let tid = opts.version;
  let root = f.ckout_required()?.dir.clone();
  let prev_vid = f.ckout_required()?.rid;
  let mut memo = ConfirmMemo::new();

  f.begin()?;
  let rc = (|| -> Result<()> {
    if prev_vid != 0 {
      changes_scan(f, prev_vid, ScanFlags::empty())?;
    }
    let old_rows: HashMap<String, VFileEntry> = vfile_rows(f, prev_vid)?
      .into_iter()
      .map(|r| (r.pathname.clone(), r))
      .collect();
    let targets = target_files(f, tid)?;

    for tf in &targets {
      let disk = stat_file(&root.join(&tf.name));
      let old = old_rows.get(&tf.name);
      if disk.exists {
        let question = match old {
          Some(row) if row.chnged != ChangeState::Unchanged => {
            Some(ConfirmEventId::OverwriteModFile)
          }
          Some(_) => None, // clean managed file: ours to replace
          None => Some(ConfirmEventId::OverwriteUnmgdFile),
        };
        if let Some(id) = question {
          let ev = ConfirmEvent {
            id,
            filename: Some(&tf.name),
            uuid: Some(&tf.uuid),
          };
          match memo.ask(f, &ev) {
            ConfirmResponse::Yes | ConfirmResponse::Always => {}
            ConfirmResponse::No | ConfirmResponse::Never => {
              notify(&mut opts.callback, &tf.name, FileChangeType::None)?;
              continue;
            }
            ConfirmResponse::Cancel => {
              return Err(SiltError::new(
                ErrorKind::Break,
                "checkout cancelled by the confirmer",
              ));
            }
          }
        } else if let Some(row) = old {
          // Unchanged on disk and same content in the target: skip.
          if row.rid == tf.rid && row.chnged == ChangeState::Unchanged {
            notify(&mut opts.callback, &tf.name, FileChangeType::None)?;
            continue;
          }
        }
        write_target_file(f, &root, tf, opts.dry_run, opts.set_mtime, tid)?;
        notify(&mut opts.callback, &tf.name, FileChangeType::Updated)?;
      } else {
        write_target_file(f, &root, tf, opts.dry_run, opts.set_mtime, tid)?;
        notify(&mut opts.callback, &tf.name, FileChangeType::Added)?;
      }
    }

    // Managed files with no counterpart in the target.
    let target_names: std::collections::HashSet<&str> =
      targets.iter().map(|t| t.name.as_str()).collect();
    for (name, row) in &old_rows {
      if target_names.contains(name.as_str()) {
        continue;
      }
      let disk = stat_file(&root.join(name));
      if disk.exists && row.chnged != ChangeState::Unchanged {
        let ev = ConfirmEvent {
          id: ConfirmEventId::RmModUnmgdFile,
          filename: Some(name),
          uuid: None,
        };
        match memo.ask(f, &ev) {
          ConfirmResponse::Yes | ConfirmResponse::Always => {}
          ConfirmResponse::Cancel => {
            return Err(SiltError::new(
              ErrorKind::Break,
              "checkout cancelled by the confirmer",
            ));
          }
          _ => {
            notify(&mut opts.callback, name, FileChangeType::None)?;
            continue;
          }
        }
      }
      if !opts.dry_run && disk.exists {
        // Filesystem refusal must not poison the transaction.
        if let Err(e) = remove_and_prune(&root, name) {
          warn!(file = %name, error = %e, "could not remove during checkout");
        }
      }
      notify(&mut opts.callback, name, FileChangeType::Rm)?;
    }

    if !opts.dry_run {
      finish_version_switch(f, tid)?;
    }
    Ok(())
  })();
  match rc {
    Ok(()) => {
      f.end(!opts.dry_run)?;
      if opts.dry_run {
        // end(false) above already rolled back; nothing recorded.
      }
      debug!(tid, dry_run = opts.dry_run, "checkout finished");
      Ok(())
    }
    Err(e) => {
      f.end(false)?;
      Err(e)
    }
  }
}

/// Common tail of checkout and update: reload vfile, move the version
/// pointers, clear merge state, regenerate the manifest files, refresh the
/// fingerprint.
fn finish_version_switch(f: &mut Fossil, tid: i64) -> Result<()> {
  f.db().exec("DELETE FROM ckout.vfile", [])?;
  vfile_load(f, tid)?;
  vfile_unload_except(f, tid)?;
  let uuid = crate::blob::rid_to_uuid(f, tid)?.ok_or_else(|| {
    SiltError::not_found(format!("no blob for checkout target {tid}"))
  })?;
  crate::repo::vvar_set(f, "checkout", &tid.to_string())?;
  crate::repo::vvar_set(f, "checkout-hash", &uuid)?;
  f.db().exec("DELETE FROM ckout.vmerge", [])?;
  if let Some(ck) = f.cache.ckout.as_mut() {
    ck.rid = tid;
    ck.uuid = Some(uuid);
  }
  manifest_files_write(f, tid)?;
  fingerprint_write(f)?;
  Ok(())
}

// ============================================================================
// Update (three-way)
// ============================================================================

/// Options for [`ckout_update`].
pub struct UpdateOpts<'a> {
  /// Target checkin rid; 0 asks for the unique child of the current
  /// version.
  pub version: i64,
  pub dry_run: bool,
  pub callback: Option<ChangeCallback<'a>>,
}

impl UpdateOpts<'_> {
  pub fn new(version: i64) -> Self {
    Self {
      version,
      dry_run: false,
      callback: None,
    }
  }
}

/// One row of the update scratch alignment.
#[derive(Debug)]
struct FvRow {
  fn_: String,
  /// vfile id in the current version, 0 when target-only.
  idv: i64,
  ridv: i64,
  ridt: i64,
  chnged: ChangeState,
  deleted: bool,
  is_exe: bool,
  islinkv: bool,
  islinkt: bool,
  perm_t: FilePerm,
  uuid_t: Option<String>,
  /// Name in the target, when a rename was detected.
  fnt: Option<String>,
}

/// Post-loop adjustments applied to the freshly-loaded target vfile.
enum PostFix {
  CopyAdd(VFileEntry),
  MarkDeleted(String),
  MarkModified(String),
  DropRow(String),
}

/// Resolve an update target of 0 to the unique child of `vid`.
fn pick_update_target(f: &mut Fossil, vid: i64) -> Result<i64> {
  let mut children: Vec<i64> = Vec::new();
  f.db().each(
    "SELECT cid FROM repo.plink WHERE pid=?1 ORDER BY mtime DESC",
    [vid],
    |r| {
      children.push(r.get(0)?);
      Ok(())
    },
  )?;
  match children.len() {
    0 => Ok(vid),
    1 => Ok(children[0]),
    _ => {
      let mut memo = ConfirmMemo::new();
      let ev = ConfirmEvent {
        id: ConfirmEventId::MultipleVersions,
        filename: None,
        uuid: None,
      };
      match memo.ask(f, &ev) {
        ConfirmResponse::Yes | ConfirmResponse::Always => Ok(children[0]),
        _ => Err(SiltError::new(
          ErrorKind::Ambiguous,
          format!("version {vid} has {} children; name one", children.len()),
        )),
      }
    }
  }
}

/// Update the checkout to `version`, three-way merging local edits.
pub fn ckout_update(f: &mut Fossil, opts: &mut UpdateOpts<'_>) -> Result<()> {
  let vid = f.ckout_required()?.rid;
  let root = f.ckout_required()?.dir.clone();
  let tid = if opts.version != 0 {
    opts.version
  } else {
    pick_update_target(f, vid)?
  };
  if tid == vid {
    return Ok(());
  }
  let mut memo = ConfirmMemo::new();

  f.begin()?;
  let rc = (|| -> Result<()> {
    changes_scan(f, vid, ScanFlags::empty())?;
    let rows = vfile_rows(f, vid)?;
    let targets = target_files(f, tid)?;

    let mut fv = align_files(rows, targets);

    let mut fixes: Vec<PostFix> = Vec::new();
    for row in &mut fv {
      let action = classify_and_apply(f, &root, row, opts, &mut memo, &mut fixes)?;
      let shown = row.fnt.as_deref().unwrap_or(&row.fn_);
      notify(&mut opts.callback, shown, action)?;
    }

    if !opts.dry_run {
      finish_version_switch(f, tid)?;
      apply_post_fixes(f, tid, &root, fixes)?;
    }
    Ok(())
  })();
  match rc {
    Ok(()) => {
      f.end(!opts.dry_run)?;
      debug!(vid, tid, "update finished");
      Ok(())
    }
    Err(e) => {
      f.end(false)?;
      Err(e)
    }
  }
}

/// Align current vfile rows with the target's file list by name, then pair
/// leftover entries by content hash (rename detection).
fn align_files(rows: Vec<VFileEntry>, targets: Vec<TargetFile>) -> Vec<FvRow> {
  let mut fv: Vec<FvRow> = Vec::with_capacity(rows.len() + targets.len());
  let mut by_name: HashMap<String, usize> = HashMap::new();
  for row in rows {
    by_name.insert(row.pathname.clone(), fv.len());
    fv.push(FvRow {
      fn_: row.pathname.clone(),
      idv: row.id,
      ridv: row.rid,
      ridt: 0,
      chnged: row.chnged,
      deleted: row.deleted,
      is_exe: row.is_exe,
      islinkv: row.is_link,
      islinkt: false,
      perm_t: FilePerm::Regular,
      uuid_t: None,
      fnt: None,
    });
  }
  let mut leftovers: Vec<TargetFile> = Vec::new();
  for tf in targets {
    // Prefer the recorded prior name, then the same name.
    let slot = tf
      .prior_name
      .as_ref()
      .and_then(|p| by_name.get(p))
      .or_else(|| by_name.get(&tf.name))
      .copied();
    match slot {
      Some(i) if fv[i].ridt == 0 => {
        fv[i].ridt = tf.rid;
        fv[i].islinkt = tf.perm == FilePerm::Link;
        fv[i].perm_t = tf.perm;
        fv[i].uuid_t = Some(tf.uuid.clone());
        if fv[i].fn_ != tf.name {
          fv[i].fnt = Some(tf.name.clone());
        }
      }
      _ => leftovers.push(tf),
    }
  }
  // Rename detection for the rest: a vanished local file whose recorded
  // content re-appears under a new name.
  for tf in leftovers {
    let candidate = fv
      .iter()
      .position(|r| r.ridt == 0 && r.idv > 0 && r.ridv == tf.rid);
    match candidate {
      Some(i) => {
        fv[i].ridt = tf.rid;
        fv[i].islinkt = tf.perm == FilePerm::Link;
        fv[i].perm_t = tf.perm;
        fv[i].uuid_t = Some(tf.uuid.clone());
        fv[i].fnt = Some(tf.name.clone());
      }
      None => fv.push(FvRow {
        fn_: tf.name.clone(),
        idv: 0,
        ridv: 0,
        ridt: tf.rid,
        chnged: ChangeState::Unchanged,
        deleted: false,
        is_exe: tf.perm == FilePerm::Exe,
        islinkv: false,
        islinkt: tf.perm == FilePerm::Link,
        perm_t: tf.perm,
        uuid_t: Some(tf.uuid.clone()),
        fnt: None,
      }),
    }
  }
  fv
}

fn classify_and_apply(
  f: &mut Fossil,
  root: &Path,
  row: &FvRow,
  opts: &mut UpdateOpts<'_>,
  memo: &mut ConfirmMemo,
  fixes: &mut Vec<PostFix>,
) -> Result<FileChangeType> {
  let target_name = row.fnt.clone().unwrap_or_else(|| row.fn_.clone());
  let tf = || TargetFile {
    name: target_name.clone(),
    uuid: row.uuid_t.clone().unwrap_or_default(),
    rid: row.ridt,
    perm: row.perm_t,
    prior_name: None,
  };

  // Locally-deleted files keep their deletion across the update.
  if row.deleted && row.idv > 0 {
    if row.ridt > 0 {
      fixes.push(PostFix::MarkDeleted(target_name));
    }
    return Ok(FileChangeType::RmPropagated);
  }

  match (row.idv > 0, row.ridv > 0, row.ridt > 0) {
    // Local queued add, unknown to the target: carry it forward.
    (true, false, false) => {
      let entry = VFileEntry {
        id: 0,
        vid: 0,
        rid: 0,
        mrid: 0,
        chnged: ChangeState::Unchanged,
        deleted: false,
        is_exe: row.is_exe,
        is_link: row.islinkv,
        mtime: 0,
        pathname: row.fn_.clone(),
        origname: None,
      };
      fixes.push(PostFix::CopyAdd(entry));
      Ok(FileChangeType::AddPropagated)
    }
    // Local queued add that the target also introduces.
    (true, false, true) => {
      fixes.push(PostFix::MarkModified(target_name));
      Ok(FileChangeType::ConflictAdded)
    }
    // Present only in the target.
    (false, _, true) => {
      let disk = stat_file(&root.join(&target_name));
      if disk.exists {
        let same = row
          .uuid_t
          .as_deref()
          .and_then(|u| HashAlgo::of_uuid(u).map(|a| (u, a)))
          .map(|(u, a)| {
            crate::hash::hash_file(a, &root.join(&target_name))
              .map(|h| h == u)
              .unwrap_or(false)
          })
          .unwrap_or(false);
        if same {
          return Ok(FileChangeType::None);
        }
        let ev = ConfirmEvent {
          id: ConfirmEventId::OverwriteUnmgdFile,
          filename: Some(&target_name),
          uuid: row.uuid_t.as_deref(),
        };
        match memo.ask(f, &ev) {
          ConfirmResponse::Yes | ConfirmResponse::Always => {
            write_target_file(f, root, &tf(), opts.dry_run, false, 0)?;
          }
          ConfirmResponse::Cancel => {
            return Err(SiltError::new(
              ErrorKind::Break,
              "update cancelled by the confirmer",
            ));
          }
          _ => {}
        }
        Ok(FileChangeType::ConflictAddedUnmanaged)
      } else {
        write_target_file(f, root, &tf(), opts.dry_run, false, 0)?;
        Ok(FileChangeType::Added)
      }
    }
    // Managed here, gone in the target.
    (true, true, false) => {
      if row.chnged != ChangeState::Unchanged {
        fixes.push(PostFix::DropRow(row.fn_.clone()));
        return Ok(FileChangeType::ConflictRm);
      }
      if !opts.dry_run {
        if let Err(e) = remove_and_prune(root, &row.fn_) {
          warn!(file = %row.fn_, error = %e, "could not remove during update");
        }
      }
      Ok(FileChangeType::Rm)
    }
    // Known on both sides.
    (true, true, true) => {
      let renamed = row.fnt.is_some();
      if row.ridv == row.ridt {
        if renamed {
          if !opts.dry_run {
            let from = root.join(&row.fn_);
            let to = root.join(&target_name);
            if let Some(parent) = to.parent() {
              std::fs::create_dir_all(parent)?;
            }
            if from.exists() {
              std::fs::rename(&from, &to)?;
            } else {
              write_target_file(f, root, &tf(), false, false, 0)?;
            }
          }
          return Ok(FileChangeType::Renamed);
        }
        return Ok(FileChangeType::None);
      }
      // Differing content; local state decides.
      if !row.chnged.is_content_change() {
        if renamed && !opts.dry_run {
          remove_and_prune(root, &row.fn_).ok();
        }
        write_target_file(f, root, &tf(), opts.dry_run, false, 0)?;
        return Ok(FileChangeType::Updated);
      }
      // Both sides changed: merge.
      if row.islinkv || row.islinkt {
        fixes.push(PostFix::MarkModified(target_name));
        return Ok(FileChangeType::ConflictSymlink);
      }
      let pivot = crate::blob::content_get(f, row.ridv)?;
      let local = std::fs::read(root.join(&row.fn_)).unwrap_or_default();
      let other = crate::blob::content_get(f, row.ridt)?;
      match merge3::merge3(&pivot, &local, &other) {
        Err(e) if e.kind() == ErrorKind::Type => {
          write_target_file(f, root, &tf(), opts.dry_run, false, 0)?;
          Ok(FileChangeType::UpdatedBinary)
        }
        Err(e) => Err(e),
        Ok(m) => {
          if !opts.dry_run {
            if renamed {
              remove_and_prune(root, &row.fn_).ok();
            }
            write_managed_file(
              &root.join(&target_name),
              &m.bytes,
              row.perm_t == FilePerm::Exe,
              false,
            )?;
          }
          fixes.push(PostFix::MarkModified(target_name));
          if m.conflicts > 0 {
            Ok(FileChangeType::ConflictMerged)
          } else {
            Ok(FileChangeType::Merged)
          }
        }
      }
    }
    _ => Ok(FileChangeType::None),
  }
}

/// Re-apply carried-over local state onto the freshly loaded target vfile.
fn apply_post_fixes(f: &mut Fossil, tid: i64, root: &Path, fixes: Vec<PostFix>) -> Result<()> {
  for fix in fixes {
    match fix {
      PostFix::CopyAdd(entry) => {
        let disk = stat_file(&root.join(&entry.pathname));
        f.db().exec(
          "INSERT OR REPLACE INTO ckout.vfile
             (vid, chnged, deleted, isexe, islink, rid, mrid, mtime, pathname, origname)
           VALUES (?1, 0, 0, ?2, ?3, 0, 0, ?4, ?5, NULL)",
          rusqlite::params![tid, entry.is_exe, entry.is_link, disk.mtime, entry.pathname],
        )?;
      }
      PostFix::MarkDeleted(name) => {
        f.db().exec(
          "UPDATE ckout.vfile SET deleted=1 WHERE vid=?1 AND pathname=?2",
          rusqlite::params![tid, name],
        )?;
      }
      PostFix::MarkModified(name) => {
        let disk = stat_file(&root.join(&name));
        f.db().exec(
          "UPDATE ckout.vfile SET chnged=?3, mtime=?4 WHERE vid=?1 AND pathname=?2",
          rusqlite::params![
            tid,
            name,
            ChangeState::Modified.as_int(),
            disk.mtime
          ],
        )?;
      }
      PostFix::DropRow(name) => {
        f.db().exec(
          "DELETE FROM ckout.vfile WHERE vid=?1 AND pathname=?2",
          rusqlite::params![tid, name],
        )?;
      }
    }
  }
  Ok(())
}
