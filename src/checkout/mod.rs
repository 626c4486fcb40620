//! Checkout state: the `vfile` table, change scanning, and the files the
//! engine maintains at the checkout root.

mod commit;
mod manage;
mod update;

pub use commit::{checkin_commit, reload_checkout_state, CommitOpts};
pub use manage::{
  manage, revert, unmanage, ManageCounts, ManageOpt, RevertAction, RevertOpt, UnmanageOpt,
};
pub use update::{ckout_update, repo_ckout, CkoutOpts, FileChangeType, UpdateOpts};

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::constants::{MANIFEST_FILE, MANIFEST_TAGS_FILE, MANIFEST_UUID_FILE};
use crate::context::Fossil;
use crate::deck::{FilePerm, SaType};
use crate::error::{ErrorKind, Result, SiltError};
use crate::hash::HashAlgo;
use crate::util::time;

// ============================================================================
// Change states
// ============================================================================

/// The `vfile.chnged` state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeState {
  #[default]
  Unchanged,
  Modified,
  MergeModified,
  MergeAdded,
  IntegrateModified,
  IntegrateAdded,
  BecameExec,
  BecameSymlink,
  NotExec,
  NotSymlink,
}

impl ChangeState {
  pub fn as_int(self) -> i64 {
    match self {
      ChangeState::Unchanged => 0,
      ChangeState::Modified => 1,
      ChangeState::MergeModified => 2,
      ChangeState::MergeAdded => 3,
      ChangeState::IntegrateModified => 4,
      ChangeState::IntegrateAdded => 5,
      ChangeState::BecameExec => 6,
      ChangeState::BecameSymlink => 7,
      ChangeState::NotExec => 8,
      ChangeState::NotSymlink => 9,
    }
  }

  pub fn from_int(v: i64) -> Self {
    match v {
      1 => ChangeState::Modified,
      2 => ChangeState::MergeModified,
      3 => ChangeState::MergeAdded,
      4 => ChangeState::IntegrateModified,
      5 => ChangeState::IntegrateAdded,
      6 => ChangeState::BecameExec,
      7 => ChangeState::BecameSymlink,
      8 => ChangeState::NotExec,
      9 => ChangeState::NotSymlink,
      _ => ChangeState::Unchanged,
    }
  }

  /// Does this state carry content changes (vs. attribute-only flips)?
  pub fn is_content_change(self) -> bool {
    matches!(
      self,
      ChangeState::Modified
        | ChangeState::MergeModified
        | ChangeState::MergeAdded
        | ChangeState::IntegrateModified
        | ChangeState::IntegrateAdded
    )
  }
}

bitflags! {
  /// Options for [`changes_scan`].
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct ScanFlags: u32 {
    /// Hash every file, ignoring the mtime/size fast path.
    const HASH = 0x01;
    /// Rewrite recorded mtimes to the canonical manifest mtime.
    const SETMTIME = 0x02;
    /// Record the scanned vid as the current checkout version.
    const WRITE_CKOUT_VERSION = 0x04;
  }
}

// ============================================================================
// vfile rows
// ============================================================================

/// One row of the `vfile` table.
#[derive(Debug, Clone)]
pub struct VFileEntry {
  pub id: i64,
  pub vid: i64,
  pub rid: i64,
  pub mrid: i64,
  pub chnged: ChangeState,
  pub deleted: bool,
  pub is_exe: bool,
  pub is_link: bool,
  pub mtime: i64,
  pub pathname: String,
  pub origname: Option<String>,
}

/// Read all vfile rows for `vid`, pathname-ordered.
pub fn vfile_rows(f: &Fossil, vid: i64) -> Result<Vec<VFileEntry>> {
  let mut out = Vec::new();
  f.db().each(
    "SELECT id, vid, rid, mrid, chnged, deleted, isexe, islink, mtime, pathname, origname
       FROM ckout.vfile WHERE vid=?1 ORDER BY pathname",
    [vid],
    |r| {
      out.push(VFileEntry {
        id: r.get(0)?,
        vid: r.get(1)?,
        rid: r.get::<_, Option<i64>>(2)?.unwrap_or(0),
        mrid: r.get::<_, Option<i64>>(3)?.unwrap_or(0),
        chnged: ChangeState::from_int(r.get(4)?),
        deleted: r.get(5)?,
        is_exe: r.get::<_, Option<bool>>(6)?.unwrap_or(false),
        is_link: r.get::<_, Option<bool>>(7)?.unwrap_or(false),
        mtime: r.get::<_, Option<i64>>(8)?.unwrap_or(0),
        pathname: r.get(9)?,
        origname: r.get(10)?,
      });
      Ok(())
    },
  )?;
  Ok(out)
}

/// Populate `vfile` for `vid` from the checkin's effective file list, when
/// no rows for that vid exist yet.
pub fn vfile_load(f: &mut Fossil, vid: i64) -> Result<()> {
  if vid == 0 {
    return Ok(());
  }
  let have = f
    .db()
    .one_i64("SELECT count(*) FROM ckout.vfile WHERE vid=?1", [vid])?
    .unwrap_or(0);
  if have > 0 {
    return Ok(());
  }
  let mut deck = crate::deck::load(f, vid, SaType::Checkin)?;
  deck.load_baseline(f)?;
  let cards: Vec<(String, String, FilePerm)> = deck
    .fcards_effective()?
    .into_iter()
    .filter_map(|fc| {
      fc.uuid
        .clone()
        .map(|u| (fc.name.clone(), u, fc.perm))
    })
    .collect();
  for (name, uuid, perm) in cards {
    let rid = crate::blob::uuid_to_rid(f, &uuid)?.unwrap_or(0);
    f.db().exec(
      "INSERT OR REPLACE INTO ckout.vfile
         (vid, chnged, deleted, isexe, islink, rid, mrid, mtime, pathname, origname)
       VALUES (?1, 0, 0, ?2, ?3, ?4, ?4, 0, ?5, NULL)",
      rusqlite::params![
        vid,
        perm == FilePerm::Exe,
        perm == FilePerm::Link,
        rid,
        name
      ],
    )?;
  }
  debug!(vid, "vfile populated");
  Ok(())
}

/// Drop vfile rows for every version except `keep_vid`.
pub fn vfile_unload_except(f: &Fossil, keep_vid: i64) -> Result<()> {
  f.db()
    .exec("DELETE FROM ckout.vfile WHERE vid<>?1", [keep_vid])?;
  Ok(())
}

// ============================================================================
// Filesystem probes
// ============================================================================

/// Absolute on-disk path of a checkout-relative name.
pub fn ckout_file_path(f: &Fossil, name: &str) -> Result<PathBuf> {
  Ok(f.ckout_required()?.dir.join(name))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
  pub exists: bool,
  pub size: i64,
  pub mtime: i64,
  pub is_exe: bool,
  pub is_link: bool,
}

pub fn stat_file(path: &Path) -> FileStat {
  let meta = match std::fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(_) => return FileStat::default(),
  };
  let is_link = meta.file_type().is_symlink();
  let mtime = meta
    .modified()
    .ok()
    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0);
  #[cfg(unix)]
  let is_exe = {
    use std::os::unix::fs::PermissionsExt;
    !is_link && meta.permissions().mode() & 0o111 != 0
  };
  #[cfg(not(unix))]
  let is_exe = false;
  FileStat {
    exists: true,
    size: meta.len() as i64,
    mtime,
    is_exe,
    is_link,
  }
}

// ============================================================================
// Change scan
// ============================================================================

/// Reconcile `vfile` with on-disk state for `vid`.
pub fn changes_scan(f: &mut Fossil, vid: i64, flags: ScanFlags) -> Result<()> {
  vfile_load(f, vid)?;
  let rows = vfile_rows(f, vid)?;
  let root = f.ckout_required()?.dir.clone();
  for row in rows {
    if row.rid == 0 {
      continue; // queued add: nothing recorded to compare against
    }
    let disk = stat_file(&root.join(&row.pathname));
    if !disk.exists {
      // Missing files keep their recorded state; the change report layer
      // surfaces them by re-stating.
      continue;
    }
    let mut chnged = row.chnged;
    let mut new_mtime = row.mtime;
    let attr_flip = if row.is_link != disk.is_link {
      Some(if disk.is_link {
        ChangeState::BecameSymlink
      } else {
        ChangeState::NotSymlink
      })
    } else if row.is_exe != disk.is_exe {
      Some(if disk.is_exe {
        ChangeState::BecameExec
      } else {
        ChangeState::NotExec
      })
    } else {
      None
    };

    let stored_size = crate::blob::content_size(f, row.rid)?.unwrap_or(-1);
    let fast_path_clean =
      !flags.contains(ScanFlags::HASH) && disk.mtime == row.mtime && disk.size == stored_size;
    if fast_path_clean {
      if !chnged.is_content_change() {
        chnged = ChangeState::Unchanged;
      }
    } else {
      let uuid = crate::blob::rid_to_uuid(f, row.rid)?.unwrap_or_default();
      let algo = HashAlgo::of_uuid(&uuid).unwrap_or(HashAlgo::Sha3);
      let disk_hash = crate::hash::hash_file(algo, &root.join(&row.pathname))?;
      if disk_hash == uuid {
        if chnged == ChangeState::Modified {
          chnged = ChangeState::Unchanged;
        }
        new_mtime = disk.mtime;
      } else {
        // Preserve pending merge states; a plain edit is Modified.
        if !matches!(
          chnged,
          ChangeState::MergeModified
            | ChangeState::MergeAdded
            | ChangeState::IntegrateModified
            | ChangeState::IntegrateAdded
        ) {
          chnged = ChangeState::Modified;
        }
      }
    }
    if chnged == ChangeState::Unchanged {
      if let Some(flip) = attr_flip {
        chnged = flip;
      }
    }
    if flags.contains(ScanFlags::SETMTIME) {
      if let Some(mt) = manifest_file_mtime(f, vid, &row.pathname)? {
        new_mtime = mt;
        filetime::set_file_mtime(
          root.join(&row.pathname),
          filetime::FileTime::from_unix_time(mt, 0),
        )
        .ok();
      }
    }
    if chnged != row.chnged || new_mtime != row.mtime {
      f.db().exec(
        "UPDATE ckout.vfile SET chnged=?1, mtime=?2 WHERE id=?3",
        rusqlite::params![chnged.as_int(), new_mtime, row.id],
      )?;
      trace!(path = %row.pathname, state = ?chnged, "scan updated vfile row");
    }
  }
  if flags.contains(ScanFlags::WRITE_CKOUT_VERSION) {
    crate::repo::vvar_set(f, "checkout", &vid.to_string())?;
  }
  Ok(())
}

/// The canonical mtime of a file: when the youngest ancestor of `vid` that
/// introduced or modified it was checked in.
pub fn manifest_file_mtime(f: &Fossil, vid: i64, pathname: &str) -> Result<Option<i64>> {
  let jd = f.db().one_f64(
    "WITH RECURSIVE anc(x) AS (
       SELECT ?1
       UNION
       SELECT plink.pid FROM repo.plink JOIN anc ON plink.cid=anc.x
     )
     SELECT max(e.mtime)
       FROM repo.mlink m
       JOIN repo.event e ON e.objid=m.mid
       JOIN repo.filename fn ON fn.fnid=m.fnid
      WHERE m.mid IN (SELECT x FROM anc) AND fn.name=?2",
    rusqlite::params![vid, pathname],
  )?;
  Ok(jd.map(time::julian_to_unix))
}

/// Does the checkout carry any pending change (edits, adds, removes,
/// renames, merge state)?
pub fn ckout_has_changes(f: &Fossil) -> Result<bool> {
  let vid = f.ckout_required()?.rid;
  let n = f
    .db()
    .one_i64(
      "SELECT count(*) FROM ckout.vfile
        WHERE vid=?1
          AND (chnged<>0 OR deleted<>0 OR rid=0
               OR (origname IS NOT NULL AND origname<>pathname))",
      [vid],
    )?
    .unwrap_or(0);
  if n > 0 {
    return Ok(true);
  }
  let merges = f
    .db()
    .one_i64("SELECT count(*) FROM ckout.vmerge", [])?
    .unwrap_or(0);
  Ok(merges > 0)
}

// ============================================================================
// Change reporting
// ============================================================================

/// One pending change, as reported to callers.
#[derive(Debug, Clone)]
pub struct FileChange {
  pub pathname: String,
  pub state: ChangeState,
  /// Queued add, never committed.
  pub added: bool,
  /// Queued removal.
  pub deleted: bool,
  /// The file is tracked but absent on disk.
  pub missing: bool,
  pub renamed_from: Option<String>,
}

/// Report every pending change in the current checkout. A `Break` return
/// from the callback stops the walk without error.
pub fn changes_foreach(
  f: &mut Fossil,
  mut cb: impl FnMut(&FileChange) -> crate::error::Result<()>,
) -> crate::error::Result<()> {
  let vid = f.ckout_required()?.rid;
  let root = f.ckout_required()?.dir.clone();
  for row in vfile_rows(f, vid)? {
    let disk = stat_file(&root.join(&row.pathname));
    let renamed_from = row
      .origname
      .clone()
      .filter(|o| *o != row.pathname);
    let change = FileChange {
      state: row.chnged,
      added: row.rid == 0,
      deleted: row.deleted,
      missing: row.rid != 0 && !disk.exists,
      renamed_from,
      pathname: row.pathname,
    };
    let pending = change.state != ChangeState::Unchanged
      || change.added
      || change.deleted
      || change.missing
      || change.renamed_from.is_some();
    if !pending {
      continue;
    }
    match cb(&change) {
      Ok(()) => {}
      Err(e) if e.is_break() => break,
      Err(e) => return Err(e),
    }
  }
  Ok(())
}

/// Files on disk that no vfile row covers ("extra" files). Never recorded,
/// only reported. Honors `ignore-globs`.
pub fn extras(f: &Fossil) -> Result<Vec<String>> {
  let vid = f.ckout_required()?.rid;
  let root = f.ckout_required()?.dir.clone();
  let mut tracked: std::collections::HashSet<String> = std::collections::HashSet::new();
  f.db().each(
    "SELECT pathname FROM ckout.vfile WHERE vid=?1",
    [vid],
    |r| {
      tracked.insert(r.get(0)?);
      Ok(())
    },
  )?;
  let cs = f.db().filenames_case_sensitive();
  let mut out = Vec::new();
  let mut stack = vec![String::new()];
  while let Some(rel) = stack.pop() {
    let abs = if rel.is_empty() {
      root.clone()
    } else {
      root.join(&rel)
    };
    for entry in std::fs::read_dir(&abs)? {
      let entry = entry?;
      let name = entry.file_name().to_string_lossy().into_owned();
      let child = if rel.is_empty() {
        name.clone()
      } else {
        format!("{rel}/{name}")
      };
      if !crate::util::path::is_simple_pathname(&child) {
        continue; // state databases and reserved names
      }
      if matches!(
        child.as_str(),
        MANIFEST_FILE | MANIFEST_UUID_FILE | MANIFEST_TAGS_FILE
      ) {
        continue;
      }
      if entry.file_type()?.is_dir() {
        stack.push(child);
        continue;
      }
      if tracked.contains(&child) {
        continue;
      }
      if let Some(globs) = &f.cache.ignore_globs {
        if globs.matches(&child, cs).is_some() {
          continue;
        }
      }
      out.push(child);
    }
  }
  out.sort();
  Ok(out)
}

// ============================================================================
// Manifest file emission
// ============================================================================

/// Letters enabled by the `manifest` config setting.
fn manifest_setting(f: &Fossil) -> Result<(bool, bool, bool)> {
  let v = crate::repo::config_get_text(f, "manifest")?.unwrap_or_default();
  let v = v.trim();
  if v.is_empty() {
    return Ok((false, false, false));
  }
  if crate::repo::value_is_truthy(v) && !v.bytes().any(|b| matches!(b, b'r' | b'u' | b't')) {
    // "on" (and equivalents) aliases "ru".
    return Ok((true, true, false));
  }
  Ok((
    v.contains('r'),
    v.contains('u'),
    v.contains('t'),
  ))
}

/// Write (or retire) the `manifest`, `manifest.uuid` and `manifest.tags`
/// files for the current checkout version.
pub fn manifest_files_write(f: &mut Fossil, vid: i64) -> Result<()> {
  let (want_raw, want_uuid, want_tags) = manifest_setting(f)?;
  let root = f.ckout_required()?.dir.clone();
  let uuid = crate::blob::rid_to_uuid(f, vid)?.ok_or_else(|| {
    SiltError::not_found(format!("no blob for checkout version {vid}"))
  })?;
  let mtime = f
    .db()
    .one_f64("SELECT mtime FROM repo.event WHERE objid=?1", [vid])?
    .map(time::julian_to_unix);

  let emit = |f: &mut Fossil, name: &str, want: bool, bytes: Option<Vec<u8>>| -> Result<()> {
    let path = root.join(name);
    if want {
      if let Some(bytes) = bytes {
        std::fs::write(&path, bytes)?;
        if let Some(mt) = mtime {
          filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mt, 0)).ok();
        }
      }
    } else {
      // Only unlink when the file is not itself under version control.
      let tracked = f
        .db()
        .one_i64(
          "SELECT 1 FROM ckout.vfile WHERE vid=?1 AND pathname=?2",
          rusqlite::params![vid, name],
        )?
        .is_some();
      if !tracked && path.exists() {
        std::fs::remove_file(&path).ok();
      }
    }
    Ok(())
  };

  let raw = if want_raw {
    Some(crate::blob::content_get(f, vid)?)
  } else {
    None
  };
  emit(f, MANIFEST_FILE, want_raw, raw)?;
  emit(
    f,
    MANIFEST_UUID_FILE,
    want_uuid,
    want_uuid.then(|| format!("{uuid}\n").into_bytes()),
  )?;
  let tags = if want_tags {
    Some(manifest_tags_text(f, vid)?.into_bytes())
  } else {
    None
  };
  emit(f, MANIFEST_TAGS_FILE, want_tags, tags)?;
  Ok(())
}

/// `manifest.tags` body: the branch line then each applied sym- tag.
fn manifest_tags_text(f: &Fossil, vid: i64) -> Result<String> {
  let branch = crate::xlink::branch_of(f, vid)?.unwrap_or_default();
  let mut out = String::new();
  if !branch.is_empty() {
    out.push_str(&format!("branch {branch}\n"));
  }
  let mut tags: Vec<String> = Vec::new();
  f.db().each(
    "SELECT t.tagname FROM repo.tagxref x JOIN repo.tag t ON t.tagid=x.tagid
      WHERE x.rid=?1 AND x.tagtype>0 AND t.tagname GLOB 'sym-*'
      ORDER BY t.tagname",
    [vid],
    |r| {
      tags.push(r.get(0)?);
      Ok(())
    },
  )?;
  for t in tags {
    out.push_str(&format!("tag {}\n", &t[4..]));
  }
  Ok(out)
}

// ============================================================================
// Fingerprint
// ============================================================================

/// Repository fingerprint: an R-card style digest over the newest
/// `rcvfrom` row. Stored in the checkout so a swapped-out repository can
/// be detected.
pub fn fingerprint_calc(f: &Fossil) -> Result<Option<String>> {
  let row: Option<(i64, Option<f64>, Option<String>)> = {
    let mut out = None;
    f.db().each(
      "SELECT rcvid, mtime, nonce FROM repo.rcvfrom ORDER BY rcvid DESC LIMIT 1",
      [],
      |r| {
        out = Some((r.get(0)?, r.get(1)?, r.get(2)?));
        Ok(())
      },
    )?;
    out
  };
  Ok(row.map(|(rcvid, mtime, nonce)| {
    let seed = format!(
      "{rcvid}/{}/{}",
      mtime.unwrap_or(0.0),
      nonce.unwrap_or_default()
    );
    format!("{rcvid}/{}", crate::hash::md5_hex(seed.as_bytes()))
  }))
}

/// Record the current repository fingerprint in the checkout.
pub fn fingerprint_write(f: &mut Fossil) -> Result<()> {
  if let Some(fp) = fingerprint_calc(f)? {
    crate::repo::vvar_set(f, "fingerprint", &fp)?;
  }
  Ok(())
}

/// Verify the checkout's recorded fingerprint against the repository. A
/// missing fingerprint (older checkout databases) passes; a mismatch is a
/// dedicated error.
pub fn ckout_fingerprint_check(f: &Fossil) -> Result<()> {
  let Some(recorded) = crate::repo::vvar_get(f, "fingerprint")? else {
    return Ok(());
  };
  let current = fingerprint_calc(f)?;
  if current.as_deref() == Some(recorded.as_str()) {
    Ok(())
  } else {
    Err(SiltError::new(
      ErrorKind::RepoMismatch,
      "checkout fingerprint does not match the attached repository",
    ))
  }
}

// ============================================================================
// Shared file helpers
// ============================================================================

/// Write blob content to a checkout file, creating parent directories and
/// applying the permission bits.
pub(crate) fn write_managed_file(
  path: &Path,
  content: &[u8],
  perm_exe: bool,
  perm_link: bool,
) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  if path.exists() || std::fs::symlink_metadata(path).is_ok() {
    std::fs::remove_file(path).ok();
  }
  #[cfg(unix)]
  if perm_link {
    let target = String::from_utf8_lossy(content).into_owned();
    std::os::unix::fs::symlink(target, path)?;
    return Ok(());
  }
  std::fs::write(path, content)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    let mode = if perm_exe { 0o755 } else { 0o644 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
  }
  #[cfg(not(unix))]
  {
    let _ = (perm_exe, perm_link);
  }
  Ok(())
}

/// Remove a file, then rmdir any directories the removal emptied, up to
/// (never including) the checkout root.
pub(crate) fn remove_and_prune(root: &Path, rel: &str) -> std::io::Result<()> {
  let path = root.join(rel);
  std::fs::remove_file(&path)?;
  let mut dir = path.parent().map(Path::to_path_buf);
  while let Some(d) = dir {
    if d == *root {
      break;
    }
    if std::fs::remove_dir(&d).is_err() {
      break; // not empty, or already gone
    }
    dir = d.parent().map(Path::to_path_buf);
  }
  Ok(())
}
