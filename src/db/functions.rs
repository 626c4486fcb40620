//! SQL user functions installed on every main connection.
//!
//! These are part of the stable contract: engine SQL and caller-defined
//! views both use them. Functions that need repository access re-enter the
//! invoking connection; the ones that need engine state (current user,
//! checkout directory, collation mode) read it from the shared [`UdfState`].

use std::sync::{Arc, Mutex};

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::Result;
use crate::util::path::dirpart;
use crate::util::time::unix_now;

/// Engine state the SQL functions observe.
#[derive(Debug, Default)]
pub struct UdfState {
  /// Current user name, if one has been configured.
  pub user: Option<String>,
  /// Absolute checkout root, when a checkout is attached.
  pub ckout_dir: Option<String>,
  /// Filename comparison mode.
  pub case_sensitive: bool,
}

fn udf_err(e: crate::error::SiltError) -> rusqlite::Error {
  rusqlite::Error::UserFunctionError(Box::new(e))
}

/// Re-enter the connection a function was invoked on.
fn invoking_conn<'a>(
  ctx: &'a Context<'_>,
) -> rusqlite::Result<rusqlite::functions::ConnectionRef<'a>> {
  // The engine is single-threaded per context, so re-entering the invoking
  // connection cannot alias a concurrent statement.
  unsafe { ctx.get_connection() }
}

/// Resolve the single argument of fsl_content()/fsl_sym2rid() to a rid.
fn arg_to_rid(ctx: &Context<'_>, conn: &Connection) -> rusqlite::Result<i64> {
  match ctx.get_raw(0) {
    ValueRef::Integer(i) => Ok(i),
    ValueRef::Text(t) => {
      let s = String::from_utf8_lossy(t);
      crate::resolver::sym_to_rid_raw(conn, &s, crate::resolver::SymFilter::Any, None)
        .map_err(udf_err)
    }
    _ => Err(udf_err(crate::error::SiltError::misuse(
      "expecting an integer rid or a symbol string",
    ))),
  }
}

/// Install all engine SQL functions on `conn`.
pub fn register_all(conn: &Connection, state: &Arc<Mutex<UdfState>>) -> Result<()> {
  let utf8 = FunctionFlags::SQLITE_UTF8;
  let det = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

  conn.create_scalar_function("now", 0, utf8, |_| Ok(unix_now()))?;

  let st = Arc::clone(state);
  conn.create_scalar_function("fsl_user", 0, utf8, move |_| {
    Ok(st.lock().expect("udf state lock").user.clone())
  })?;

  let st = Arc::clone(state);
  conn.create_scalar_function("fsl_ckout_dir", 0, utf8, move |_| {
    Ok(st.lock().expect("udf state lock").ckout_dir.clone())
  })?;

  for n_arg in [1, 2] {
    conn.create_scalar_function("fsl_dirpart", n_arg, det, move |ctx| {
      let path: String = ctx.get(0)?;
      let keep_slash = if n_arg == 2 { ctx.get::<i64>(1)? != 0 } else { false };
      Ok(dirpart(&path, keep_slash).to_string())
    })?;
  }

  // fsl_match_vfile_or_dir(p, needle): true when p IS needle or p lies
  // under directory needle. Honors the filename collation mode.
  let st = Arc::clone(state);
  conn.create_scalar_function("fsl_match_vfile_or_dir", 2, utf8, move |ctx| {
    let p: String = ctx.get(0)?;
    let needle: String = ctx.get(1)?;
    if needle.is_empty() {
      return Ok(true); // empty needle means "the whole checkout"
    }
    let cs = st.lock().expect("udf state lock").case_sensitive;
    let (pc, nc) = if cs {
      (p, needle)
    } else {
      (p.to_ascii_lowercase(), needle.to_ascii_lowercase())
    };
    let nc = nc.trim_end_matches('/');
    Ok(pc == nc || (pc.len() > nc.len() && pc.starts_with(nc) && pc.as_bytes()[nc.len()] == b'/'))
  })?;

  conn.create_scalar_function("fsl_sym2rid", 1, utf8, |ctx| {
    let conn = invoking_conn(ctx)?;
    arg_to_rid(ctx, &conn)
  })?;

  conn.create_scalar_function("fsl_content", 1, utf8, |ctx| {
    let conn = invoking_conn(ctx)?;
    let rid = arg_to_rid(ctx, &conn)?;
    crate::blob::content_get_raw(&conn, rid).map_err(udf_err)
  })?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use crate::db::Db;

  #[test]
  fn test_now_and_dirpart() {
    let db = Db::open_main().unwrap();
    let t = db.one_i64("SELECT now()", []).unwrap().unwrap();
    assert!(t > 1_500_000_000);
    assert_eq!(
      db.one_text("SELECT fsl_dirpart('a/b/c.txt')", []).unwrap().unwrap(),
      "a/b"
    );
    assert_eq!(
      db.one_text("SELECT fsl_dirpart('a/b/c.txt', 1)", []).unwrap().unwrap(),
      "a/b/"
    );
  }

  #[test]
  fn test_fsl_user_tracks_state() {
    let db = Db::open_main().unwrap();
    assert_eq!(db.one_text("SELECT fsl_user()", []).unwrap(), None);
    db.udf_state().lock().unwrap().user = Some("alice".into());
    assert_eq!(
      db.one_text("SELECT fsl_user()", []).unwrap().unwrap(),
      "alice"
    );
  }

  #[test]
  fn test_match_vfile_or_dir() {
    let db = Db::open_main().unwrap();
    let q = |p: &str, n: &str| -> i64 {
      db.one_i64("SELECT fsl_match_vfile_or_dir(?1, ?2)", [p, n])
        .unwrap()
        .unwrap()
    };
    assert_eq!(q("src/main.rs", "src"), 1);
    assert_eq!(q("src/main.rs", "src/"), 1);
    assert_eq!(q("src/main.rs", "src/main.rs"), 1);
    assert_eq!(q("srcs/main.rs", "src"), 0);
    assert_eq!(q("other.rs", "src"), 0);
    assert_eq!(q("anything", ""), 1);
  }
}
