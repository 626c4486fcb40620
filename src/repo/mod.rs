//! Repository and checkout lifecycle: create, open, close, config access.

mod schema;

pub use schema::{
  CKOUT_SCHEMA, CONFIG_SCHEMA, REPO_SCHEMA_STATIC, REPO_SCHEMA_TRANSIENT, TICKET_SCHEMA,
};

use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::{debug, info};

use crate::constants::{
  AUX_SCHEMA, CKOUT_DB_NAME_UNIX, CKOUT_DB_NAME_WINDOWS, CONTENT_SCHEMA, DEFAULT_MAIN_BRANCH,
};
use crate::context::{CkoutState, Fossil};
use crate::db::DbRole;
use crate::deck::{Deck, SaType, TagType};
use crate::error::{ErrorKind, Result, SiltError};
use crate::util::time;

/// Config entry names copied from a template repository at creation time.
const TEMPLATE_CONFIG_GLOBS: &[&str] = &[
  "css",
  "header",
  "footer",
  "logo-*",
  "project-*",
  "skin*",
  "label-*",
  "ticket-*",
  "th1-*",
];

/// System pseudo-users seeded by `repo_create` when requested.
const STANDARD_USERS: &[(&str, &str, &str)] = &[
  ("anonymous", "ghmnw", "Anon"),
  ("nobody", "gjorz", "Nobody"),
  ("developer", "ei", "Dev"),
  ("reader", "kptw", "Reader"),
];

// ============================================================================
// Config access
// ============================================================================

/// Loose boolean semantics config values use: "on"/"yes"/"true"/nonzero.
pub fn value_is_truthy(v: &str) -> bool {
  let v = v.trim();
  if v.is_empty() {
    return false;
  }
  if v.eq_ignore_ascii_case("on")
    || v.eq_ignore_ascii_case("yes")
    || v.eq_ignore_ascii_case("true")
  {
    return true;
  }
  v.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

pub fn config_get_text(f: &Fossil, name: &str) -> Result<Option<String>> {
  f.db()
    .one_text("SELECT value FROM repo.config WHERE name=?1", [name])
}

pub fn config_get_bool(f: &Fossil, name: &str) -> Result<bool> {
  Ok(
    config_get_text(f, name)?
      .map(|v| value_is_truthy(&v))
      .unwrap_or(false),
  )
}

pub fn config_set_text(f: &Fossil, name: &str, value: &str) -> Result<()> {
  f.db().exec(
    "INSERT OR REPLACE INTO repo.config(name, value, mtime) VALUES (?1, ?2, now())",
    rusqlite::params![name, value],
  )?;
  Ok(())
}

/// Global (per-user) config, available once a config db is attached.
pub fn global_config_get(f: &Fossil, name: &str) -> Result<Option<String>> {
  if !f.db().is_attached(DbRole::Config) {
    return Ok(None);
  }
  f.db()
    .one_text("SELECT value FROM cfg.global_config WHERE name=?1", [name])
}

pub fn global_config_set(f: &Fossil, name: &str, value: &str) -> Result<()> {
  f.db().exec(
    "INSERT OR REPLACE INTO cfg.global_config(name, value) VALUES (?1, ?2)",
    rusqlite::params![name, value],
  )?;
  Ok(())
}

/// Checkout-local state variables.
pub fn vvar_get(f: &Fossil, name: &str) -> Result<Option<String>> {
  f.db()
    .one_text("SELECT value FROM ckout.vvar WHERE name=?1", [name])
}

pub fn vvar_set(f: &Fossil, name: &str, value: &str) -> Result<()> {
  f.db().exec(
    "INSERT OR REPLACE INTO ckout.vvar(name, value) VALUES (?1, ?2)",
    rusqlite::params![name, value],
  )?;
  Ok(())
}

pub fn vvar_remove(f: &Fossil, name: &str) -> Result<()> {
  f.db()
    .exec("DELETE FROM ckout.vvar WHERE name=?1", [name])?;
  Ok(())
}

// ============================================================================
// Open a per-user config database
// ============================================================================

/// Attach (creating if needed) the per-user global config database.
pub fn config_open(f: &mut Fossil, file: &Path) -> Result<()> {
  f.db.attach(DbRole::Config, file)?;
  f.db.exec_script(CONFIG_SCHEMA)?;
  Ok(())
}

pub fn config_close(f: &mut Fossil) -> Result<()> {
  f.db.detach(DbRole::Config)
}

// ============================================================================
// Repository creation
// ============================================================================

/// Options for [`repo_create`].
#[derive(Debug, Clone, Default)]
pub struct RepoCreateOpts {
  /// Repository database file to create.
  pub path: PathBuf,
  /// Admin user name. Falls back to the context user.
  pub username: Option<String>,
  /// Allow replacing an existing file.
  pub allow_overwrite: bool,
  /// Seed the anonymous/nobody/developer/reader pseudo-users.
  pub add_default_users: bool,
  /// When set, save an initial empty checkin with this comment.
  pub commit_message: Option<String>,
  /// Repository whose reportfmt/skin config/system users to copy.
  pub config_template: Option<PathBuf>,
}

impl RepoCreateOpts {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      ..Self::default()
    }
  }

  pub fn username(mut self, u: impl Into<String>) -> Self {
    self.username = Some(u.into());
    self
  }

  pub fn allow_overwrite(mut self, yes: bool) -> Self {
    self.allow_overwrite = yes;
    self
  }

  pub fn add_default_users(mut self, yes: bool) -> Self {
    self.add_default_users = yes;
    self
  }

  pub fn commit_message(mut self, msg: impl Into<String>) -> Self {
    self.commit_message = Some(msg.into());
    self
  }
}

fn random_hex_code() -> String {
  let mut code = [0u8; 20];
  rand::thread_rng().fill_bytes(&mut code);
  hex::encode(code)
}

/// Create a repository database, install its schema, seed config and users,
/// and (optionally) save an initial empty checkin. Leaves the repository
/// open on the context.
pub fn repo_create(f: &mut Fossil, opts: &RepoCreateOpts) -> Result<()> {
  if f.db.is_attached(DbRole::Repo) {
    return Err(SiltError::misuse("a repository is already attached"));
  }
  if opts.path.exists() {
    if !opts.allow_overwrite {
      return Err(SiltError::new(
        ErrorKind::AlreadyExists,
        format!("file exists: {}", opts.path.display()),
      ));
    }
    std::fs::remove_file(&opts.path)?;
  }
  let user = opts
    .username
    .clone()
    .or_else(|| f.user().map(String::from))
    .ok_or_else(|| SiltError::new(ErrorKind::MissingInfo, "no user name for repo creation"))?;
  f.set_user(&user);

  f.db.attach(DbRole::Repo, &opts.path)?;
  let rc = (|| -> Result<()> {
    f.begin()?;
    let rc = create_in_txn(f, opts, &user);
    f.end(rc.is_ok())?;
    rc
  })();
  if rc.is_err() {
    f.db.detach(DbRole::Repo).ok();
    return rc;
  }
  f.cache.project_code = config_get_text(f, "project-code")?;
  record_repo_filename(f)?;
  info!(repo = %opts.path.display(), "repository created");
  Ok(())
}

fn create_in_txn(f: &mut Fossil, opts: &RepoCreateOpts, user: &str) -> Result<()> {
  f.db.exec_script(REPO_SCHEMA_STATIC)?;
  f.db.exec_script(REPO_SCHEMA_TRANSIENT)?;
  f.db.exec_script(TICKET_SCHEMA)?;

  config_set_text(f, "project-code", &random_hex_code())?;
  config_set_text(f, "server-code", &random_hex_code())?;
  config_set_text(f, "content-schema", CONTENT_SCHEMA)?;
  config_set_text(f, "aux-schema", AUX_SCHEMA)?;
  config_set_text(f, "main-branch", DEFAULT_MAIN_BRANCH)?;

  f.db.exec(
    "INSERT INTO repo.user(login, pw, cap, info, mtime) VALUES (?1, lower(hex(randomblob(6))), 's', '', now())",
    [user],
  )?;
  if opts.add_default_users {
    for (login, cap, info) in STANDARD_USERS {
      f.db.exec(
        "INSERT OR IGNORE INTO repo.user(login, pw, cap, info, mtime)
         VALUES (?1, lower(hex(randomblob(6))), ?2, ?3, now())",
        rusqlite::params![login, cap, info],
      )?;
    }
  }

  if let Some(tmpl) = &opts.config_template {
    copy_template(f, tmpl)?;
  }

  if let Some(msg) = &opts.commit_message {
    save_initial_checkin(f, user, msg)?;
  }
  Ok(())
}

/// Copy skin/report/user seed data from a template repository.
fn copy_template(f: &Fossil, tmpl: &Path) -> Result<()> {
  let fname = tmpl.to_string_lossy();
  f.db
    .exec("ATTACH DATABASE ?1 AS tmpl", [fname.as_ref()])?;
  let rc = (|| -> Result<()> {
    f.db.exec_script(
      "INSERT OR IGNORE INTO repo.reportfmt SELECT * FROM tmpl.reportfmt",
    )?;
    for glob in TEMPLATE_CONFIG_GLOBS {
      f.db.exec(
        "INSERT OR REPLACE INTO repo.config(name, value, mtime)
         SELECT name, value, now() FROM tmpl.config WHERE name GLOB ?1",
        [glob],
      )?;
    }
    for (login, ..) in STANDARD_USERS {
      f.db.exec(
        "UPDATE repo.user
            SET cap   = (SELECT cap FROM tmpl.user WHERE login=?1),
                info  = (SELECT info FROM tmpl.user WHERE login=?1),
                mtime = (SELECT mtime FROM tmpl.user WHERE login=?1),
                photo = (SELECT photo FROM tmpl.user WHERE login=?1)
          WHERE login=?1
            AND EXISTS (SELECT 1 FROM tmpl.user WHERE login=?1)",
        [login],
      )?;
    }
    Ok(())
  })();
  f.db.exec_script("DETACH DATABASE tmpl").ok();
  rc
}

/// The initial empty checkin: comment, date, user, empty R, trunk branch
/// tags, nothing else.
fn save_initial_checkin(f: &mut Fossil, user: &str, msg: &str) -> Result<()> {
  let mut d = Deck::new(SaType::Checkin);
  d.set_comment(msg)?;
  d.set_date_julian(time::julian_now())?;
  d.set_user(user)?;
  d.set_r_card(crate::constants::MD5_EMPTY_HEX)?;
  d.add_tag(TagType::Propagating, "branch", None, Some(DEFAULT_MAIN_BRANCH))?;
  d.add_tag(
    TagType::Propagating,
    &format!("sym-{DEFAULT_MAIN_BRANCH}"),
    None,
    None,
  )?;
  let saved = crate::deck::save(f, &mut d, false)?;
  debug!(rid = saved.rid, uuid = %saved.uuid, "initial checkin saved");
  Ok(())
}

// ============================================================================
// Repository open / close
// ============================================================================

/// Open an existing repository database and load its cached config into the
/// context.
pub fn repo_open(f: &mut Fossil, path: &Path) -> Result<()> {
  if f.db.is_attached(DbRole::Repo) {
    return Err(SiltError::new(
      ErrorKind::Access,
      "a repository is already attached",
    ));
  }
  if !path.exists() {
    return Err(SiltError::not_found(format!(
      "no such repository: {}",
      path.display()
    )));
  }
  f.db.attach(DbRole::Repo, path)?;
  if let Err(e) = verify_repo_schema(f) {
    f.db.detach(DbRole::Repo).ok();
    return Err(e);
  }
  f.cache.project_code = config_get_text(f, "project-code")?;
  if let Some(p) = config_get_text(f, "hash-policy")? {
    f.config.hash_policy = crate::blob::HashPolicy::from_config_name(&p)
      .ok_or_else(|| SiltError::range(format!("unknown hash-policy: {p:?}")))?;
  }
  if f.config.user.is_none() {
    if let Some(u) = config_get_text(f, "default-user")? {
      f.set_user(u);
    }
  }
  f.cache.ignore_globs = Some(crate::util::glob::GlobList::parse(
    &config_get_text(f, "ignore-globs")?.unwrap_or_default(),
  ));
  f.cache.binary_globs = Some(crate::util::glob::GlobList::parse(
    &config_get_text(f, "binary-glob")?.unwrap_or_default(),
  ));
  f.cache.crnl_globs = Some(crate::util::glob::GlobList::parse(
    &config_get_text(f, "crnl-glob")?.unwrap_or_default(),
  ));
  f.config.calc_r_card = tip_uses_r_card(f)?;
  record_repo_filename(f)?;
  debug!(repo = %path.display(), "repository opened");
  Ok(())
}

fn verify_repo_schema(f: &Fossil) -> Result<()> {
  let has_tables = f.db.one_i64(
    "SELECT count(*) FROM repo.sqlite_master WHERE name IN ('blob','config')",
    [],
  )?;
  if has_tables != Some(2) {
    return Err(SiltError::new(
      ErrorKind::NotARepo,
      "database lacks the repository schema",
    ));
  }
  let content = config_get_text(f, "content-schema")?;
  match content.as_deref() {
    Some(CONTENT_SCHEMA) => {}
    Some(v) if v < CONTENT_SCHEMA => {
      return Err(SiltError::new(
        ErrorKind::RepoNeedsRebuild,
        format!("content-schema {v:?} predates {CONTENT_SCHEMA:?}"),
      ));
    }
    other => {
      return Err(SiltError::new(
        ErrorKind::RepoVersion,
        format!("unsupported content-schema {other:?}"),
      ));
    }
  }
  let aux = config_get_text(f, "aux-schema")?;
  match aux.as_deref() {
    Some(AUX_SCHEMA) => {}
    Some(v) if v < AUX_SCHEMA => {
      return Err(SiltError::new(
        ErrorKind::RepoNeedsRebuild,
        format!("aux-schema {v:?} predates {AUX_SCHEMA:?}"),
      ));
    }
    other => {
      return Err(SiltError::new(
        ErrorKind::RepoVersion,
        format!("unsupported aux-schema {other:?}"),
      ));
    }
  }
  Ok(())
}

/// Probe whether this repository has historically generated R-cards: look
/// at the newest checkin.
fn tip_uses_r_card(f: &mut Fossil) -> Result<bool> {
  let tip = f.db.one_i64(
    "SELECT objid FROM repo.event WHERE type='ci' ORDER BY mtime DESC LIMIT 1",
    [],
  )?;
  let Some(rid) = tip else { return Ok(false) };
  let bytes = match crate::blob::content_get(f, rid) {
    Ok(b) => b,
    Err(_) => return Ok(false),
  };
  Ok(
    bytes.starts_with(b"R ")
      || bytes.windows(3).any(|w| w == b"\nR "),
  )
}

/// Detach the repository. Never writes.
pub fn repo_close(f: &mut Fossil) -> Result<()> {
  if f.db.transaction_level() > 0 {
    return Err(SiltError::misuse(
      "cannot close a repository inside a transaction",
    ));
  }
  f.db.detach(DbRole::Repo)?;
  f.cache.project_code = None;
  f.cache.content.clear();
  f.cache.bags.clear();
  f.cache.verify_rids.clear();
  f.cache.rcvid = 0;
  Ok(())
}

/// Record the canonical repository (and checkout) location in the global
/// config, when one is attached and writable.
fn record_repo_filename(f: &Fossil) -> Result<()> {
  if !f.db.is_attached(DbRole::Config) {
    return Ok(());
  }
  if let Some(repo) = f.db.role_path(DbRole::Repo) {
    let abs = std::fs::canonicalize(&repo).unwrap_or(repo);
    global_config_set(f, &format!("repo:{}", abs.display()), "1")?;
  }
  if let Some(ck) = &f.cache.ckout {
    global_config_set(f, &format!("ckout:{}", ck.dir.display()), "1")?;
  }
  Ok(())
}

// ============================================================================
// Checkout open / create
// ============================================================================

/// What to do when a checkout database already exists at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
  /// Fail with `AlreadyExists`.
  #[default]
  Error,
  Always,
  Never,
}

fn ckout_db_name() -> &'static str {
  if cfg!(windows) {
    CKOUT_DB_NAME_WINDOWS
  } else {
    CKOUT_DB_NAME_UNIX
  }
}

/// Create (or re-open) a checkout state database in `dir` bound to the
/// currently-open repository.
pub fn ckout_create(f: &mut Fossil, dir: &Path, policy: OverwritePolicy) -> Result<()> {
  let repo_path = f
    .db
    .role_path(DbRole::Repo)
    .ok_or_else(|| SiltError::new(ErrorKind::NotARepo, "no repository is attached"))?;
  std::fs::create_dir_all(dir)?;
  let dbfile = dir.join(ckout_db_name());
  if dbfile.exists() {
    match policy {
      OverwritePolicy::Error => {
        return Err(SiltError::new(
          ErrorKind::AlreadyExists,
          format!("checkout database exists: {}", dbfile.display()),
        ));
      }
      OverwritePolicy::Never => return attach_ckout(f, dir, &dbfile),
      OverwritePolicy::Always => std::fs::remove_file(&dbfile)?,
    }
  }
  attach_ckout(f, dir, &dbfile)?;
  let repo_abs = std::fs::canonicalize(&repo_path).unwrap_or(repo_path);
  vvar_set(f, "repository", &repo_abs.to_string_lossy())?;
  vvar_set(f, "checkout", "0")?;
  record_repo_filename(f)?;
  Ok(())
}

fn attach_ckout(f: &mut Fossil, dir: &Path, dbfile: &Path) -> Result<()> {
  f.db.attach(DbRole::Ckout, dbfile)?;
  f.db.exec_script(CKOUT_SCHEMA)?;
  let abs = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
  let rid = vvar_get(f, "checkout")?
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(0);
  let uuid = vvar_get(f, "checkout-hash")?;
  f.db.udf_state().lock().expect("udf state lock").ckout_dir =
    Some(abs.to_string_lossy().into_owned());
  f.cache.ckout = Some(CkoutState {
    dir: abs,
    rid,
    uuid,
  });
  Ok(())
}

/// Walk upward from `dir` looking for a checkout database; attach it and
/// transitively open the repository it references.
pub fn ckout_open_dir(f: &mut Fossil, dir: &Path) -> Result<()> {
  let start = std::fs::canonicalize(dir)?;
  let mut probe: &Path = &start;
  let mut found = None;
  loop {
    for name in [CKOUT_DB_NAME_UNIX, CKOUT_DB_NAME_WINDOWS] {
      let candidate = probe.join(name);
      if candidate.is_file() {
        found = Some((probe.to_path_buf(), candidate));
        break;
      }
    }
    if found.is_some() {
      break;
    }
    match probe.parent() {
      Some(p) => probe = p,
      None => break,
    }
  }
  let Some((root, dbfile)) = found else {
    return Err(SiltError::new(
      ErrorKind::NotACkout,
      format!("no checkout at or above {}", start.display()),
    ));
  };
  attach_ckout(f, &root, &dbfile)?;
  if !f.db.is_attached(DbRole::Repo) {
    let repo = vvar_get(f, "repository")?.ok_or_else(|| {
      SiltError::consistency("checkout database names no repository")
    })?;
    let repo_path = PathBuf::from(repo);
    let repo_path = if repo_path.is_absolute() {
      repo_path
    } else {
      root.join(repo_path)
    };
    if let Err(e) = repo_open(f, &repo_path) {
      f.db.detach(DbRole::Ckout).ok();
      f.cache.ckout = None;
      return Err(e);
    }
  }
  record_repo_filename(f)?;
  Ok(())
}

/// Detach the checkout state database.
pub fn ckout_close(f: &mut Fossil) -> Result<()> {
  f.db.detach(DbRole::Ckout)?;
  f.cache.ckout = None;
  f.db.udf_state().lock().expect("udf state lock").ckout_dir = None;
  Ok(())
}
