//! The relational layer.
//!
//! One logical connection (an in-memory "main" database) carries up to three
//! role-tagged ATTACHed databases: the repository, the per-working-directory
//! checkout state, and the per-user config. All engine SQL is written
//! against the fixed role schema names.
//!
//! Two behaviors here are load-bearing for the rest of the engine:
//!
//! - Transactions nest by counter. An inner `end(false)` poisons the outer
//!   levels: the outermost `end(true)` still rolls back.
//! - Prepared statements may be loaned out for reuse, but each SQL text has
//!   at most one live loan. Re-acquiring a loaned statement is `Misuse`.

mod functions;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, trace};

use crate::constants::{DB_ROLE_CKOUT, DB_ROLE_CONFIG, DB_ROLE_REPO};
use crate::error::{ErrorKind, Result, SiltError};

pub use functions::UdfState;

// ============================================================================
// Roles
// ============================================================================

/// The databases that may be attached to the main connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbRole {
  Repo,
  Ckout,
  Config,
}

impl DbRole {
  /// Schema name used in fully-qualified SQL.
  pub fn schema_name(self) -> &'static str {
    match self {
      DbRole::Repo => DB_ROLE_REPO,
      DbRole::Ckout => DB_ROLE_CKOUT,
      DbRole::Config => DB_ROLE_CONFIG,
    }
  }
}

// ============================================================================
// Statement loans
// ============================================================================

/// A prepared statement on loan from the connection. Dropping it returns
/// the loan; the same SQL can then be borrowed again.
#[derive(Debug)]
pub struct StmtLoan<'db> {
  stmt: rusqlite::Statement<'db>,
  sql: String,
  loans: Rc<RefCell<HashSet<String>>>,
}

impl<'db> StmtLoan<'db> {
  pub fn sql(&self) -> &str {
    &self.sql
  }

  pub fn stmt(&mut self) -> &mut rusqlite::Statement<'db> {
    &mut self.stmt
  }
}

impl Drop for StmtLoan<'_> {
  fn drop(&mut self) {
    self.loans.borrow_mut().remove(&self.sql);
  }
}

// ============================================================================
// Db
// ============================================================================

/// The engine's connection wrapper.
pub struct Db {
  conn: Connection,
  /// Transaction nesting depth. 0 = autocommit.
  tx_level: Cell<u32>,
  /// Set when any nested level requested rollback.
  tx_poisoned: Cell<bool>,
  /// SQL queued to run just before the outermost COMMIT.
  pre_commit: RefCell<Vec<String>>,
  /// SQL texts currently on loan.
  loans: Rc<RefCell<HashSet<String>>>,
  /// Attached role databases and their file paths.
  attached: RefCell<Vec<(DbRole, PathBuf)>>,
  /// State shared with the SQL user functions.
  udf: Arc<Mutex<UdfState>>,
}

impl Db {
  /// Open the in-memory main connection and install the engine's SQL
  /// functions on it.
  pub fn open_main() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let udf = Arc::new(Mutex::new(UdfState::default()));
    functions::register_all(&conn, &udf)?;
    Ok(Self {
      conn,
      tx_level: Cell::new(0),
      tx_poisoned: Cell::new(false),
      pre_commit: RefCell::new(Vec::new()),
      loans: Rc::new(RefCell::new(HashSet::new())),
      attached: RefCell::new(Vec::new()),
      udf,
    })
  }

  pub fn conn(&self) -> &Connection {
    &self.conn
  }

  pub fn udf_state(&self) -> &Arc<Mutex<UdfState>> {
    &self.udf
  }

  // ==========================================================================
  // Attachment
  // ==========================================================================

  /// ATTACH `file` under `role`. A role can be attached at most once.
  pub fn attach(&self, role: DbRole, file: &Path) -> Result<()> {
    if self.is_attached(role) {
      return Err(SiltError::misuse(format!(
        "role {} is already attached",
        role.schema_name()
      )));
    }
    let fname = file.to_string_lossy();
    self.conn.execute(
      &format!("ATTACH DATABASE ?1 AS {}", role.schema_name()),
      [fname.as_ref()],
    )?;
    debug!(role = role.schema_name(), file = %fname, "attached database");
    self.attached.borrow_mut().push((role, file.to_path_buf()));
    Ok(())
  }

  /// DETACH the database attached under `role`.
  pub fn detach(&self, role: DbRole) -> Result<()> {
    let mut attached = self.attached.borrow_mut();
    let idx = attached.iter().position(|(r, _)| *r == role).ok_or_else(|| {
      SiltError::not_found(format!("no database attached as {}", role.schema_name()))
    })?;
    self
      .conn
      .execute_batch(&format!("DETACH DATABASE {}", role.schema_name()))?;
    attached.remove(idx);
    Ok(())
  }

  pub fn is_attached(&self, role: DbRole) -> bool {
    self.attached.borrow().iter().any(|(r, _)| *r == role)
  }

  /// File path behind an attached role.
  pub fn role_path(&self, role: DbRole) -> Option<PathBuf> {
    self
      .attached
      .borrow()
      .iter()
      .find(|(r, _)| *r == role)
      .map(|(_, p)| p.clone())
  }

  // ==========================================================================
  // Transactions
  // ==========================================================================

  /// Current nesting depth.
  pub fn transaction_level(&self) -> u32 {
    self.tx_level.get()
  }

  /// Has any nested level requested rollback?
  pub fn transaction_poisoned(&self) -> bool {
    self.tx_poisoned.get()
  }

  /// Begin (or nest into) a transaction.
  pub fn begin(&self) -> Result<()> {
    if self.tx_level.get() == 0 {
      self.conn.execute_batch("BEGIN")?;
      trace!("transaction opened");
    }
    self.tx_level.set(self.tx_level.get() + 1);
    Ok(())
  }

  /// End one nesting level. `commit=false` marks the whole transaction for
  /// rollback; the outermost end performs the actual COMMIT or ROLLBACK.
  pub fn end(&self, commit: bool) -> Result<()> {
    let level = self.tx_level.get();
    if level == 0 {
      return Err(SiltError::misuse("transaction end without begin"));
    }
    if !commit {
      self.tx_poisoned.set(true);
    }
    self.tx_level.set(level - 1);
    if level > 1 {
      return Ok(());
    }
    let poisoned = self.tx_poisoned.get();
    self.tx_poisoned.set(false);
    if poisoned {
      self.pre_commit.borrow_mut().clear();
      self.conn.execute_batch("ROLLBACK")?;
      trace!("transaction rolled back");
      return Ok(());
    }
    let queued: Vec<String> = std::mem::take(&mut *self.pre_commit.borrow_mut());
    for sql in &queued {
      if let Err(e) = self.conn.execute_batch(sql) {
        self.conn.execute_batch("ROLLBACK").ok();
        return Err(SiltError::new(
          ErrorKind::Db,
          format!("pre-commit SQL failed ({e}): {sql}"),
        ));
      }
    }
    match self.conn.execute_batch("COMMIT") {
      Ok(()) => {
        trace!("transaction committed");
        Ok(())
      }
      Err(e) => {
        self.conn.execute_batch("ROLLBACK").ok();
        Err(e.into())
      }
    }
  }

  /// Unconditionally roll back and drop to level zero. Discards any queued
  /// pre-commit SQL.
  pub fn rollback_force(&self) -> Result<()> {
    if self.tx_level.get() == 0 {
      return Ok(());
    }
    self.tx_level.set(0);
    self.tx_poisoned.set(false);
    self.pre_commit.borrow_mut().clear();
    self.conn.execute_batch("ROLLBACK")?;
    trace!("transaction force-rolled-back");
    Ok(())
  }

  /// Queue SQL to run immediately before the outermost COMMIT.
  pub fn before_commit(&self, sql: impl Into<String>) -> Result<()> {
    if self.tx_level.get() == 0 {
      return Err(SiltError::misuse("before_commit requires an open transaction"));
    }
    self.pre_commit.borrow_mut().push(sql.into());
    Ok(())
  }

  // ==========================================================================
  // Statement loans
  // ==========================================================================

  /// Prepare `sql`, recording it as loaned. Loaning the same SQL twice
  /// without returning the first loan is `Misuse`; the offending SQL is
  /// named in the error.
  pub fn loan(&self, sql: &str) -> Result<StmtLoan<'_>> {
    {
      let mut loans = self.loans.borrow_mut();
      if loans.contains(sql) {
        return Err(SiltError::misuse(format!(
          "statement is already on loan: {sql}"
        )));
      }
      loans.insert(sql.to_string());
    }
    match self.conn.prepare(sql) {
      Ok(stmt) => Ok(StmtLoan {
        stmt,
        sql: sql.to_string(),
        loans: Rc::clone(&self.loans),
      }),
      Err(e) => {
        self.loans.borrow_mut().remove(sql);
        Err(e.into())
      }
    }
  }

  // ==========================================================================
  // Convenience queries
  // ==========================================================================

  pub fn exec<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
    Ok(self.conn.execute(sql, params)?)
  }

  /// Run a multi-statement script.
  pub fn exec_script(&self, sql: &str) -> Result<()> {
    Ok(self.conn.execute_batch(sql)?)
  }

  /// Single-value queries. `None` when the query yields no row.
  pub fn one_i64<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<i64>> {
    self.one_mapped(sql, params, |row| row.get(0))
  }

  pub fn one_f64<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<f64>> {
    self.one_mapped(sql, params, |row| row.get(0))
  }

  pub fn one_text<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<String>> {
    self.one_mapped(sql, params, |row| row.get(0))
  }

  pub fn one_blob<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Option<Vec<u8>>> {
    self.one_mapped(sql, params, |row| row.get(0))
  }

  fn one_mapped<P, T, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>>
  where
    P: rusqlite::Params,
    F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
  {
    let mut stmt = self.conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
      Some(row) => Ok(Some(map(row)?)),
      None => Ok(None),
    }
  }

  /// Run `f` for each result row. An `ErrorKind::Break` return from `f`
  /// stops the walk without failing.
  pub fn each<P, F>(&self, sql: &str, params: P, mut f: F) -> Result<()>
  where
    P: rusqlite::Params,
    F: FnMut(&rusqlite::Row<'_>) -> Result<()>,
  {
    let mut stmt = self.conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    while let Some(row) = rows.next()? {
      match f(row) {
        Ok(()) => {}
        Err(e) if e.is_break() => break,
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  // ==========================================================================
  // Filename collation
  // ==========================================================================

  /// Is filename comparison case-sensitive for this connection?
  pub fn filenames_case_sensitive(&self) -> bool {
    self.udf.lock().expect("udf state lock").case_sensitive
  }

  pub fn set_filenames_case_sensitive(&self, yes: bool) {
    self.udf.lock().expect("udf state lock").case_sensitive = yes;
  }

  /// SQL fragment spliced after filename comparisons: either empty or
  /// `" COLLATE nocase"`.
  pub fn filename_collation(&self) -> &'static str {
    if self.filenames_case_sensitive() {
      ""
    } else {
      " COLLATE nocase"
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_nested_commit() {
    let db = Db::open_main().unwrap();
    db.exec_script("CREATE TABLE t(x)").unwrap();
    db.begin().unwrap();
    db.begin().unwrap();
    db.exec("INSERT INTO t VALUES (1)", []).unwrap();
    db.end(true).unwrap();
    assert_eq!(db.transaction_level(), 1);
    db.end(true).unwrap();
    assert_eq!(db.one_i64("SELECT count(*) FROM t", []).unwrap(), Some(1));
  }

  #[test]
  fn test_inner_rollback_poisons_outer_commit() {
    let db = Db::open_main().unwrap();
    db.exec_script("CREATE TABLE t(x)").unwrap();
    db.begin().unwrap();
    db.begin().unwrap();
    db.exec("INSERT INTO t VALUES (1)", []).unwrap();
    db.end(false).unwrap(); // inner rollback request
    db.end(true).unwrap(); // outer commit still rolls back
    assert_eq!(db.one_i64("SELECT count(*) FROM t", []).unwrap(), Some(0));
    assert_eq!(db.transaction_level(), 0);
  }

  #[test]
  fn test_pre_commit_sql_runs_on_commit_only() {
    let db = Db::open_main().unwrap();
    db.exec_script("CREATE TABLE t(x)").unwrap();
    db.begin().unwrap();
    db.before_commit("INSERT INTO t VALUES (42)").unwrap();
    db.end(true).unwrap();
    assert_eq!(db.one_i64("SELECT x FROM t", []).unwrap(), Some(42));

    db.begin().unwrap();
    db.before_commit("INSERT INTO t VALUES (43)").unwrap();
    db.end(false).unwrap();
    assert_eq!(db.one_i64("SELECT count(*) FROM t", []).unwrap(), Some(1));
  }

  #[test]
  fn test_statement_loan_is_exclusive() {
    let db = Db::open_main().unwrap();
    let sql = "SELECT 1";
    let loan = db.loan(sql).unwrap();
    let err = db.loan(sql).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Misuse);
    assert!(err.message().contains(sql));
    drop(loan);
    db.loan(sql).unwrap();
  }

  #[test]
  fn test_rollback_force_clears_everything() {
    let db = Db::open_main().unwrap();
    db.exec_script("CREATE TABLE t(x)").unwrap();
    db.begin().unwrap();
    db.begin().unwrap();
    db.before_commit("INSERT INTO t VALUES (9)").unwrap();
    db.rollback_force().unwrap();
    assert_eq!(db.transaction_level(), 0);
    db.begin().unwrap();
    db.end(true).unwrap();
    assert_eq!(db.one_i64("SELECT count(*) FROM t", []).unwrap(), Some(0));
  }

  #[test]
  fn test_break_stops_each_without_error() {
    let db = Db::open_main().unwrap();
    db.exec_script("CREATE TABLE t(x); INSERT INTO t VALUES (1),(2),(3)")
      .unwrap();
    let mut seen = 0;
    db.each("SELECT x FROM t ORDER BY x", [], |_| {
      seen += 1;
      if seen == 2 {
        Err(SiltError::stop())
      } else {
        Ok(())
      }
    })
    .unwrap();
    assert_eq!(seen, 2);
  }
}
