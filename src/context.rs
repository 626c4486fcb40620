//! The context: the single runtime object owning the open databases, cached
//! config, caches, callbacks and scratch memory. Every top-level operation
//! takes the context; a context is single-threaded by construction.

use std::marker::PhantomData;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::blob::HashPolicy;
use crate::cache::{AvailabilityBags, ContentCache};
use crate::db::Db;
use crate::error::{ErrorKind, Result, SiltError};
use crate::util::glob::GlobList;

// ============================================================================
// Confirmer
// ============================================================================

/// Decision points at which the library may ask before touching a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmEventId {
  /// Checkout/update wants to overwrite a locally-modified file.
  OverwriteModFile,
  /// Checkout/update wants to overwrite an unmanaged file.
  OverwriteUnmgdFile,
  /// Checkout/update wants to remove a modified or unmanaged file.
  RmModUnmgdFile,
  /// An update target is ambiguous between multiple leaf versions.
  MultipleVersions,
}

/// One question posed to the confirmer.
#[derive(Debug)]
pub struct ConfirmEvent<'a> {
  pub id: ConfirmEventId,
  pub filename: Option<&'a str>,
  pub uuid: Option<&'a str>,
}

/// Answers a confirmer may give. `Always`/`Never` must be remembered for
/// the remainder of the surrounding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmResponse {
  Yes,
  No,
  Always,
  Never,
  Cancel,
}

impl ConfirmEventId {
  /// Answer used when no confirmer is installed.
  pub fn safe_default(self) -> ConfirmResponse {
    match self {
      ConfirmEventId::OverwriteModFile
      | ConfirmEventId::OverwriteUnmgdFile
      | ConfirmEventId::RmModUnmgdFile => ConfirmResponse::Never,
      ConfirmEventId::MultipleVersions => ConfirmResponse::Cancel,
    }
  }
}

pub type Confirmer = Box<dyn FnMut(&ConfirmEvent<'_>) -> ConfirmResponse>;

/// Per-operation memo honoring `Always`/`Never` without re-asking.
#[derive(Debug, Default)]
pub struct ConfirmMemo {
  always: Vec<ConfirmEventId>,
  never: Vec<ConfirmEventId>,
}

impl ConfirmMemo {
  pub fn new() -> Self {
    Self::default()
  }

  /// Ask, consulting and updating the memo.
  pub fn ask(&mut self, f: &mut Fossil, ev: &ConfirmEvent<'_>) -> ConfirmResponse {
    if self.always.contains(&ev.id) {
      return ConfirmResponse::Yes;
    }
    if self.never.contains(&ev.id) {
      return ConfirmResponse::No;
    }
    let answer = match f.confirmer.as_mut() {
      Some(cb) => cb(ev),
      None => ev.id.safe_default(),
    };
    match answer {
      ConfirmResponse::Always => {
        self.always.push(ev.id);
        ConfirmResponse::Yes
      }
      ConfirmResponse::Never => {
        self.never.push(ev.id);
        ConfirmResponse::No
      }
      other => other,
    }
  }
}

// ============================================================================
// Scratch pool
// ============================================================================

/// A LIFO pool of reusable byte buffers for parse/hash/checkout hot paths.
/// Leases are explicit; a leaked lease just costs the buffer.
#[derive(Debug, Default)]
pub struct ScratchPool {
  bufs: Vec<Vec<u8>>,
}

const SCRATCH_POOL_MAX: usize = 6;

impl ScratchPool {
  pub fn lease(&mut self) -> Vec<u8> {
    self.bufs.pop().unwrap_or_default()
  }

  pub fn give_back(&mut self, mut buf: Vec<u8>) {
    if self.bufs.len() < SCRATCH_POOL_MAX {
      buf.clear();
      self.bufs.push(buf);
    }
  }
}

// ============================================================================
// Context
// ============================================================================

/// Cached configuration state.
#[derive(Debug)]
pub struct CxConfig {
  pub user: Option<String>,
  pub hash_policy: HashPolicy,
  /// Generate R-cards on save. Off unless the opened repository already
  /// uses them.
  pub calc_r_card: bool,
}

impl Default for CxConfig {
  fn default() -> Self {
    Self {
      user: None,
      hash_policy: HashPolicy::Auto,
      calc_r_card: false,
    }
  }
}

/// Open-checkout state.
#[derive(Debug, Clone)]
pub struct CkoutState {
  /// Absolute checkout root.
  pub dir: PathBuf,
  /// rid of the checked-out version, 0 for an empty checkout.
  pub rid: i64,
  /// uuid of the checked-out version.
  pub uuid: Option<String>,
}

/// Mutable cache state owned by the context.
#[derive(Debug, Default)]
pub struct CxCache {
  pub content: ContentCache,
  pub bags: AvailabilityBags,
  /// rids queued for re-hash verification at the outer commit.
  pub verify_rids: Vec<i64>,
  /// Active receive batch, 0 until the first content write.
  pub rcvid: i64,
  pub project_code: Option<String>,
  pub ignore_globs: Option<GlobList>,
  pub binary_globs: Option<GlobList>,
  pub crnl_globs: Option<GlobList>,
  pub ckout: Option<CkoutState>,
  /// An unmatched crosslink_begin is pending.
  pub xlink_open: bool,
}

/// A crosslink listener: named callback invoked after an artifact's derived
/// state has been written. A returned error aborts the transaction.
pub type XlinkListener = Box<dyn FnMut(&mut Fossil, &crate::deck::Deck) -> Result<()>>;

/// The engine context.
pub struct Fossil {
  pub(crate) db: Db,
  pub(crate) config: CxConfig,
  pub(crate) cache: CxCache,
  pub(crate) xlink_listeners: IndexMap<String, XlinkListener>,
  pub(crate) confirmer: Option<Confirmer>,
  pub(crate) scratch: ScratchPool,
  /// Contexts are not Send: all interior state assumes one thread.
  _single_thread: PhantomData<*const ()>,
}

impl Fossil {
  /// Create a context with its main connection open and SQL functions
  /// registered. No repository is attached yet.
  pub fn new() -> Result<Self> {
    let db = Db::open_main()?;
    let mut f = Self {
      db,
      config: CxConfig::default(),
      cache: CxCache::default(),
      xlink_listeners: IndexMap::new(),
      confirmer: None,
      scratch: ScratchPool::default(),
      _single_thread: PhantomData,
    };
    crate::xlink::register_default_listeners(&mut f);
    Ok(f)
  }

  pub fn db(&self) -> &Db {
    &self.db
  }

  // ==========================================================================
  // Identity & policy
  // ==========================================================================

  pub fn user(&self) -> Option<&str> {
    self.config.user.as_deref()
  }

  pub fn set_user(&mut self, name: impl Into<String>) {
    let name = name.into();
    self.db.udf_state().lock().expect("udf state lock").user = Some(name.clone());
    self.config.user = Some(name);
  }

  /// The user name, or `MissingInfo`.
  pub fn user_required(&self) -> Result<&str> {
    self
      .user()
      .ok_or_else(|| SiltError::new(ErrorKind::MissingInfo, "no user name is configured"))
  }

  pub fn hash_policy(&self) -> HashPolicy {
    self.config.hash_policy
  }

  /// Change the hash policy, persisting it when a repository is attached.
  pub fn set_hash_policy(&mut self, p: HashPolicy) -> Result<HashPolicy> {
    let old = self.config.hash_policy;
    self.config.hash_policy = p;
    if self.db.is_attached(crate::db::DbRole::Repo) {
      crate::repo::config_set_text(self, "hash-policy", p.config_name())?;
    }
    Ok(old)
  }

  // ==========================================================================
  // Confirmer
  // ==========================================================================

  /// Install (or with `None`, remove) the confirmer callback.
  pub fn set_confirmer(&mut self, cb: Option<Confirmer>) {
    self.confirmer = cb;
  }

  // ==========================================================================
  // Crosslink listeners
  // ==========================================================================

  /// Register a crosslink listener. Re-registering an existing name
  /// replaces the callback in place, preserving its firing position.
  pub fn xlink_listen(&mut self, name: impl Into<String>, cb: XlinkListener) {
    // IndexMap keeps an existing key's position on insert, which is
    // exactly the replace-in-place contract listeners rely on.
    self.xlink_listeners.insert(name.into(), cb);
  }

  /// Remove a listener by name.
  pub fn xlink_unlisten(&mut self, name: &str) -> bool {
    self.xlink_listeners.shift_remove(name).is_some()
  }

  // ==========================================================================
  // Checkout state
  // ==========================================================================

  pub fn ckout(&self) -> Option<&CkoutState> {
    self.cache.ckout.as_ref()
  }

  pub fn ckout_required(&self) -> Result<&CkoutState> {
    self
      .ckout()
      .ok_or_else(|| SiltError::new(ErrorKind::NotACkout, "no checkout is attached"))
  }

  // ==========================================================================
  // Transactions (verify-at-commit aware)
  // ==========================================================================

  pub fn begin(&mut self) -> Result<()> {
    self.db.begin()
  }

  /// End one transaction level. At the outermost commit, queued blobs are
  /// re-hashed first; a verification failure turns the commit into a
  /// rollback and is returned.
  pub fn end(&mut self, commit: bool) -> Result<()> {
    if self.db.transaction_level() == 1 {
      let will_commit = commit && !self.db.transaction_poisoned();
      if will_commit && !self.cache.verify_rids.is_empty() {
        if let Err(e) = crate::blob::verify_before_commit(self) {
          self.discard_txn_caches();
          self.db.end(false)?;
          return Err(e);
        }
      }
      if !will_commit {
        // Rows cached during this transaction are about to vanish.
        self.discard_txn_caches();
      }
    }
    self.db.end(commit)
  }

  /// Unconditional rollback to level zero; drops verify queue state.
  pub fn rollback_force(&mut self) -> Result<()> {
    self.discard_txn_caches();
    self.db.rollback_force()
  }

  fn discard_txn_caches(&mut self) {
    self.cache.verify_rids.clear();
    self.cache.content.clear();
    self.cache.bags.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_confirm_memo_honors_always() {
    let mut f = Fossil::new().unwrap();
    let mut calls = 0usize;
    // A confirmer that answers Always the first time and would answer No
    // afterwards; the memo must prevent the second ask.
    let counter = std::rc::Rc::new(std::cell::Cell::new(0usize));
    let c2 = counter.clone();
    f.set_confirmer(Some(Box::new(move |_ev| {
      c2.set(c2.get() + 1);
      if c2.get() == 1 {
        ConfirmResponse::Always
      } else {
        ConfirmResponse::No
      }
    })));
    let mut memo = ConfirmMemo::new();
    for _ in 0..3 {
      let ev = ConfirmEvent {
        id: ConfirmEventId::OverwriteModFile,
        filename: Some("f.txt"),
        uuid: None,
      };
      if memo.ask(&mut f, &ev) == ConfirmResponse::Yes {
        calls += 1;
      }
    }
    assert_eq!(calls, 3);
    assert_eq!(counter.get(), 1);
  }

  #[test]
  fn test_safe_defaults_without_confirmer() {
    let mut f = Fossil::new().unwrap();
    let mut memo = ConfirmMemo::new();
    let ev = ConfirmEvent {
      id: ConfirmEventId::RmModUnmgdFile,
      filename: None,
      uuid: None,
    };
    assert_eq!(memo.ask(&mut f, &ev), ConfirmResponse::No);
  }

  #[test]
  fn test_scratch_pool_is_lifo() {
    let mut pool = ScratchPool::default();
    let mut a = pool.lease();
    a.extend_from_slice(b"xyz");
    a.reserve(4096);
    let cap = a.capacity();
    pool.give_back(a);
    let b = pool.lease();
    assert!(b.is_empty());
    assert_eq!(b.capacity(), cap);
  }
}
