//! Turning pending checkout state into a new checkin.

use tracing::{debug, info};

use crate::blob::Saved;
use crate::context::Fossil;
use crate::deck::{Deck, FilePerm, SaType};
use crate::error::{ErrorKind, Result, SiltError};
use crate::util::time;

use super::{changes_scan, stat_file, vfile_rows, ChangeState, ScanFlags};

/// Options for [`checkin_commit`].
#[derive(Debug, Clone, Default)]
pub struct CommitOpts {
  /// Checkin comment. Required.
  pub comment: String,
  /// Start (or continue) this branch instead of staying on the parent's.
  pub branch: Option<String>,
  /// Keep the new checkin out of the sync-visible set.
  pub private: bool,
  /// Allow a commit with no file-level changes.
  pub allow_empty: bool,
}

impl CommitOpts {
  pub fn new(comment: impl Into<String>) -> Self {
    Self {
      comment: comment.into(),
      ..Self::default()
    }
  }
}

/// Commit the checkout's pending state as a new checkin: store changed
/// file content, build the child manifest, save it, and advance the
/// checkout to the new version.
pub fn checkin_commit(f: &mut Fossil, opts: &CommitOpts) -> Result<Saved> {
  if opts.comment.trim().is_empty() {
    return Err(SiltError::new(
      ErrorKind::MissingInfo,
      "a checkin needs a non-empty comment",
    ));
  }
  let user = f.user_required()?.to_string();
  let vid = f.ckout_required()?.rid;
  let root = f.ckout_required()?.dir.clone();
  if vid != 0 {
    changes_scan(f, vid, ScanFlags::empty())?;
  }
  let rows = vfile_rows(f, vid)?;

  // Build the child deck: derive from the parent, or start fresh for the
  // first commit into an empty checkout.
  let mut deck = if vid != 0 {
    let mut d = crate::deck::load(f, vid, SaType::Checkin)?;
    d.load_baseline(f)?;
    d.derive(f)?;
    d
  } else {
    Deck::new(SaType::Checkin)
  };

  f.begin()?;
  let rc = (|| -> Result<Saved> {
    let mut touched = 0usize;
    for row in &rows {
      let perm = if row.is_link {
        FilePerm::Link
      } else if row.is_exe {
        FilePerm::Exe
      } else {
        FilePerm::Regular
      };
      if row.deleted {
        deck.fcard_set(&row.pathname, None, perm, None)?;
        touched += 1;
        continue;
      }
      let renamed = row
        .origname
        .as_deref()
        .is_some_and(|o| o != row.pathname);
      let needs_content = row.rid == 0 || row.chnged.is_content_change();
      if !needs_content && !renamed && !matches!(
        row.chnged,
        ChangeState::BecameExec
          | ChangeState::BecameSymlink
          | ChangeState::NotExec
          | ChangeState::NotSymlink
      ) {
        continue;
      }
      let path = root.join(&row.pathname);
      let disk = stat_file(&path);
      if !disk.exists {
        return Err(SiltError::not_found(format!(
          "cannot commit missing file {:?}",
          row.pathname
        )));
      }
      let uuid = if needs_content {
        let content = std::fs::read(&path)?;
        crate::blob::content_put(f, &content)?.uuid
      } else {
        crate::blob::rid_to_uuid(f, row.rid)?.ok_or_else(|| {
          SiltError::consistency(format!("vfile row {} names no blob", row.id))
        })?
      };
      let disk_perm = if disk.is_link {
        FilePerm::Link
      } else if disk.is_exe {
        FilePerm::Exe
      } else {
        FilePerm::Regular
      };
      if renamed {
        let orig = row.origname.clone().expect("renamed implies origname");
        deck.fcard_set(&orig, None, disk_perm, None)?;
        deck.fcard_set(&row.pathname, Some(&uuid), disk_perm, Some(&orig))?;
      } else {
        deck.fcard_set(&row.pathname, Some(&uuid), disk_perm, None)?;
      }
      touched += 1;
    }
    if touched == 0 && vid != 0 && !opts.allow_empty {
      return Err(SiltError::new(
        ErrorKind::Noop,
        "nothing to commit; use allow_empty to record an empty checkin",
      ));
    }

    deck.set_comment(&opts.comment)?;
    deck.set_date_julian(time::julian_now())?;
    deck.set_user(&user)?;
    if let Some(branch) = &opts.branch {
      deck.add_branch(branch)?;
    }
    let saved = crate::deck::save(f, &mut deck, opts.private)?;

    // Advance the checkout to the new version.
    f.db().exec("DELETE FROM ckout.vfile", [])?;
    super::vfile_load(f, saved.rid)?;
    crate::repo::vvar_set(f, "checkout", &saved.rid.to_string())?;
    crate::repo::vvar_set(f, "checkout-hash", &saved.uuid)?;
    f.db().exec("DELETE FROM ckout.vmerge", [])?;
    if let Some(ck) = f.cache.ckout.as_mut() {
      ck.rid = saved.rid;
      ck.uuid = Some(saved.uuid.clone());
    }
    super::manifest_files_write(f, saved.rid)?;
    super::fingerprint_write(f)?;
    Ok(saved)
  })();
  match rc {
    Ok(saved) => {
      f.end(true)?;
      info!(rid = saved.rid, uuid = %saved.uuid, "checkin committed");
      Ok(saved)
    }
    Err(e) => {
      f.end(false)?;
      Err(e)
    }
  }
}

/// Synchronize in-memory checkout state after an external change to the
/// `checkout` vvar (tests and callers that poke the DB directly).
pub fn reload_checkout_state(f: &mut Fossil) -> Result<()> {
  let rid = crate::repo::vvar_get(f, "checkout")?
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(0);
  let uuid = crate::repo::vvar_get(f, "checkout-hash")?;
  if let Some(ck) = f.cache.ckout.as_mut() {
    ck.rid = rid;
    ck.uuid = uuid;
  }
  debug!(rid, "checkout state reloaded");
  Ok(())
}
