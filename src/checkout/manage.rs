//! Queueing and unqueueing files: add, remove, revert.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::context::Fossil;
use crate::error::{ErrorKind, Result, SiltError};
use crate::util::path::is_simple_pathname;

use super::{changes_scan, stat_file, ChangeState, ScanFlags};

// ============================================================================
// Path resolution
// ============================================================================

/// Resolve a user-supplied file or directory to a checkout-relative path.
/// Anything outside the checkout root is refused.
pub(crate) fn to_ckout_relative(f: &Fossil, name: &str) -> Result<String> {
  let root = &f.ckout_required()?.dir;
  let p = Path::new(name);
  let rel: PathBuf = if p.is_absolute() {
    let abs = std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    abs
      .strip_prefix(root)
      .map_err(|_| {
        SiltError::misuse(format!("{name:?} lies outside the checkout root"))
      })?
      .to_path_buf()
  } else {
    PathBuf::from(name)
  };
  let rel = rel.to_string_lossy().replace('\\', "/");
  let rel = rel.trim_end_matches('/').to_string();
  Ok(rel)
}

/// Collect regular files under a checkout-relative file-or-directory.
fn collect_files(root: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
  let abs = if rel.is_empty() {
    root.to_path_buf()
  } else {
    root.join(rel)
  };
  let meta = std::fs::symlink_metadata(&abs)?;
  if meta.is_dir() {
    for entry in std::fs::read_dir(&abs)? {
      let entry = entry?;
      let child_name = entry.file_name().to_string_lossy().into_owned();
      let child_rel = if rel.is_empty() {
        child_name
      } else {
        format!("{rel}/{child_name}")
      };
      collect_files(root, &child_rel, out)?;
    }
  } else {
    out.push(rel.to_string());
  }
  Ok(())
}

// ============================================================================
// manage
// ============================================================================

/// Options for [`manage`].
pub struct ManageOpt<'a> {
  /// File or directory, checkout-relative or absolute.
  pub filename: String,
  /// Consult the repository's `ignore-globs`.
  pub check_ignore_globs: bool,
  /// Caller veto: return false to skip a candidate.
  pub predicate: Option<&'a mut dyn FnMut(&str) -> bool>,
}

impl ManageOpt<'_> {
  pub fn new(filename: impl Into<String>) -> Self {
    Self {
      filename: filename.into(),
      check_ignore_globs: false,
      predicate: None,
    }
  }
}

/// Result counters for [`manage`] and [`unmanage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManageCounts {
  pub added: usize,
  pub updated: usize,
  pub skipped: usize,
}

/// Queue files for addition: insert or refresh their `vfile` rows with
/// `rid=0`.
pub fn manage(f: &mut Fossil, opt: &mut ManageOpt<'_>) -> Result<ManageCounts> {
  let vid = f.ckout_required()?.rid;
  let root = f.ckout_required()?.dir.clone();
  let rel = to_ckout_relative(f, &opt.filename)?;
  let mut files = Vec::new();
  collect_files(&root, &rel, &mut files)?;

  let mut counts = ManageCounts::default();
  f.begin()?;
  let rc = (|| -> Result<()> {
    for name in &files {
      if !is_simple_pathname(name) {
        trace!(name, "manage skipped: reserved or malformed name");
        counts.skipped += 1;
        continue;
      }
      if opt.check_ignore_globs {
        let cs = f.db().filenames_case_sensitive();
        if let Some(globs) = &f.cache.ignore_globs {
          if globs.matches(name, cs).is_some() {
            counts.skipped += 1;
            continue;
          }
        }
      }
      if let Some(pred) = opt.predicate.as_mut() {
        if !pred(name) {
          counts.skipped += 1;
          continue;
        }
      }
      let disk = stat_file(&root.join(name));
      let existing = f.db().one_i64(
        "SELECT id FROM ckout.vfile WHERE vid=?1 AND pathname=?2",
        rusqlite::params![vid, name],
      )?;
      match existing {
        Some(id) => {
          f.db().exec(
            "UPDATE ckout.vfile SET deleted=0, mtime=?2 WHERE id=?1",
            rusqlite::params![id, disk.mtime],
          )?;
          counts.updated += 1;
        }
        None => {
          f.db().exec(
            "INSERT INTO ckout.vfile
               (vid, chnged, deleted, isexe, islink, rid, mrid, mtime, pathname, origname)
             VALUES (?1, 0, 0, ?2, ?3, 0, 0, ?4, ?5, NULL)",
            rusqlite::params![vid, disk.is_exe, disk.is_link, disk.mtime, name],
          )?;
          counts.added += 1;
        }
      }
    }
    Ok(())
  })();
  f.end(rc.is_ok())?;
  rc?;
  debug!(?counts, "manage finished");
  Ok(counts)
}

// ============================================================================
// unmanage
// ============================================================================

/// Options for [`unmanage`]: either a file/directory name or a set of
/// pre-computed vfile ids.
pub struct UnmanageOpt {
  pub filename: Option<String>,
  pub vfile_ids: Vec<i64>,
}

impl UnmanageOpt {
  pub fn by_name(filename: impl Into<String>) -> Self {
    Self {
      filename: Some(filename.into()),
      vfile_ids: Vec::new(),
    }
  }

  pub fn by_ids(ids: Vec<i64>) -> Self {
    Self {
      filename: None,
      vfile_ids: ids,
    }
  }
}

/// Queue files for removal. Rows never committed (`rid=0`) are dropped
/// outright rather than marked.
pub fn unmanage(f: &mut Fossil, opt: &UnmanageOpt) -> Result<ManageCounts> {
  let vid = f.ckout_required()?.rid;
  let mut counts = ManageCounts::default();
  f.begin()?;
  let rc = (|| -> Result<()> {
    let ids: Vec<(i64, i64)> = match &opt.filename {
      Some(name) => {
        let rel = to_ckout_relative(f, name)?;
        let mut out = Vec::new();
        f.db().each(
          "SELECT id, rid FROM ckout.vfile
            WHERE vid=?1 AND fsl_match_vfile_or_dir(pathname, ?2)",
          rusqlite::params![vid, rel],
          |r| {
            out.push((r.get(0)?, r.get::<_, Option<i64>>(1)?.unwrap_or(0)));
            Ok(())
          },
        )?;
        out
      }
      None => {
        let mut out = Vec::new();
        for id in &opt.vfile_ids {
          let rid = f
            .db()
            .one_i64("SELECT rid FROM ckout.vfile WHERE id=?1", [*id])?;
          if let Some(rid) = rid {
            out.push((*id, rid));
          }
        }
        out
      }
    };
    for (id, rid) in ids {
      if rid == 0 {
        f.db().exec("DELETE FROM ckout.vfile WHERE id=?1", [id])?;
      } else {
        f.db()
          .exec("UPDATE ckout.vfile SET deleted=1 WHERE id=?1", [id])?;
      }
      counts.updated += 1;
    }
    Ok(())
  })();
  f.end(rc.is_ok())?;
  rc?;
  Ok(counts)
}

// ============================================================================
// revert
// ============================================================================

/// What a revert did to one file, reported through the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertAction {
  /// A queued add was dropped; the file stays on disk, unmanaged.
  Unmanaged,
  /// File content (or its presence) was restored from the repository.
  Contents,
  /// A queued rename was undone.
  Renamed,
  /// The row needed no work.
  Noop,
}

/// Options for [`revert`].
pub struct RevertOpt<'a> {
  /// File or directory to revert; `None` reverts the whole checkout.
  pub filename: Option<String>,
  /// Run a change scan first so decisions see fresh state.
  pub scan_for_changes: bool,
  /// Observer; returning false vetoes that one file's revert.
  pub callback: Option<&'a mut dyn FnMut(&str, RevertAction) -> Result<bool>>,
}

impl Default for RevertOpt<'_> {
  fn default() -> Self {
    Self {
      filename: None,
      scan_for_changes: true,
      callback: None,
    }
  }
}

/// Undo pending state: drop queued adds, un-queue removals and renames,
/// restore modified content from the blob store.
pub fn revert(f: &mut Fossil, opt: &mut RevertOpt<'_>) -> Result<usize> {
  let vid = f.ckout_required()?.rid;
  let root = f.ckout_required()?.dir.clone();
  if opt.scan_for_changes && vid != 0 {
    changes_scan(f, vid, ScanFlags::empty())?;
  }
  let rows = match &opt.filename {
    Some(name) => {
      let rel = to_ckout_relative(f, name)?;
      let mut out = Vec::new();
      for row in super::vfile_rows(f, vid)? {
        let hit = f
          .db()
          .one_i64(
            "SELECT fsl_match_vfile_or_dir(?1, ?2)",
            rusqlite::params![row.pathname, rel],
          )?
          .unwrap_or(0)
          != 0;
        if hit {
          out.push(row);
        }
      }
      out
    }
    None => super::vfile_rows(f, vid)?,
  };

  let mut reverted = 0usize;
  f.begin()?;
  let rc = (|| -> Result<()> {
    for row in rows {
      // Decide the action before touching anything.
      let action = if row.rid == 0 {
        RevertAction::Unmanaged
      } else if row.origname.as_deref().is_some_and(|o| o != row.pathname) {
        RevertAction::Renamed
      } else {
        let disk = stat_file(&root.join(&row.pathname));
        if row.deleted || !disk.exists || row.chnged != ChangeState::Unchanged {
          RevertAction::Contents
        } else {
          RevertAction::Noop
        }
      };
      if action == RevertAction::Noop {
        continue;
      }
      if let Some(cb) = opt.callback.as_mut() {
        if !cb(&row.pathname, action)? {
          continue; // vetoed
        }
      }
      match action {
        RevertAction::Unmanaged => {
          f.db()
            .exec("DELETE FROM ckout.vfile WHERE id=?1", [row.id])?;
        }
        RevertAction::Renamed => {
          let orig = row.origname.clone().expect("checked above");
          let new_path = root.join(&row.pathname);
          let old_path = root.join(&orig);
          if new_path.exists() {
            if let Some(parent) = old_path.parent() {
              std::fs::create_dir_all(parent)?;
            }
            // Moving beats re-writing the content when the bytes are
            // untouched.
            std::fs::rename(&new_path, &old_path)?;
          }
          restore_content(f, &root, &orig, &row)?;
          let disk = stat_file(&old_path);
          f.db().exec(
            "UPDATE ckout.vfile
                SET pathname=?2, origname=NULL, chnged=0, deleted=0, mtime=?3
              WHERE id=?1",
            rusqlite::params![row.id, orig, disk.mtime],
          )?;
          prune_empty_dirs(&root, &row.pathname);
        }
        RevertAction::Contents => {
          restore_content(f, &root, &row.pathname, &row)?;
          let disk = stat_file(&root.join(&row.pathname));
          f.db().exec(
            "UPDATE ckout.vfile
                SET chnged=0, deleted=0, origname=NULL, mtime=?2
              WHERE id=?1",
            rusqlite::params![row.id, disk.mtime],
          )?;
        }
        RevertAction::Noop => unreachable!(),
      }
      f.db()
        .exec("DELETE FROM ckout.vmerge WHERE id=?1", [row.id])?;
      reverted += 1;
    }
    Ok(())
  })();
  f.end(rc.is_ok())?;
  rc?;
  debug!(reverted, "revert finished");
  Ok(reverted)
}

/// Rewrite a managed file from its recorded blob unless the bytes already
/// match.
fn restore_content(
  f: &mut Fossil,
  root: &Path,
  name: &str,
  row: &super::VFileEntry,
) -> Result<()> {
  let content = crate::blob::content_get(f, row.rid).map_err(|e| {
    if e.kind() == ErrorKind::Phantom {
      SiltError::new(
        ErrorKind::Phantom,
        format!("cannot revert {name:?}: content has not been received"),
      )
    } else {
      e
    }
  })?;
  super::write_managed_file(&root.join(name), &content, row.is_exe, row.is_link)
}

/// Try to rmdir the (now possibly empty) parents of a removed path.
fn prune_empty_dirs(root: &Path, rel: &str) {
  let mut dir = Path::new(rel).parent();
  while let Some(d) = dir {
    if d.as_os_str().is_empty() {
      break;
    }
    if std::fs::remove_dir(root.join(d)).is_err() {
      break;
    }
    dir = d.parent();
  }
}
