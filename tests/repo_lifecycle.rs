//! Repository lifecycle: creation, the seeded initial checkin, reopen,
//! and schema verification.

use silt::checkout::{ckout_fingerprint_check, fingerprint_write};
use silt::deck::{SaType, TagType};
use silt::repo::{self, RepoCreateOpts};
use silt::resolver::{rid_is_a_checkin, sym_to_rid, SymFilter};
use silt::{ErrorKind, Fossil};

fn new_repo(dir: &std::path::Path, msg: Option<&str>) -> Fossil {
  let mut f = Fossil::new().expect("context");
  let mut opts = RepoCreateOpts::new(dir.join("r.fsl"))
    .username("alice")
    .add_default_users(true);
  if let Some(msg) = msg {
    opts = opts.commit_message(msg);
  }
  repo::repo_create(&mut f, &opts).expect("repo_create");
  f
}

#[test]
fn create_seeds_config_and_users() {
  let dir = tempfile::tempdir().expect("tempdir");
  let f = new_repo(dir.path(), None);

  let pc = repo::config_get_text(&f, "project-code")
    .expect("config read")
    .expect("project-code present");
  assert_eq!(pc.len(), 40);
  assert_eq!(
    repo::config_get_text(&f, "content-schema").unwrap().as_deref(),
    Some("2")
  );
  assert_eq!(
    repo::config_get_text(&f, "aux-schema").unwrap().as_deref(),
    Some("2015-01-24")
  );
  assert_eq!(
    repo::config_get_text(&f, "main-branch").unwrap().as_deref(),
    Some("trunk")
  );
  let users = f
    .db()
    .one_i64("SELECT count(*) FROM repo.user", [])
    .unwrap()
    .unwrap();
  assert_eq!(users, 5); // alice + the four standard pseudo-users
}

#[test]
fn create_and_commit_scenario() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = new_repo(dir.path(), Some("egg"));

  // Exactly one blob exists: the initial checkin artifact.
  let blobs = f
    .db()
    .one_i64("SELECT count(*) FROM repo.blob", [])
    .unwrap()
    .unwrap();
  assert_eq!(blobs, 1);

  let tip = sym_to_rid(&f, "tip", SymFilter::Checkin).expect("tip resolves");
  assert!(rid_is_a_checkin(&f, tip).unwrap());

  let d = silt::deck::load(&mut f, tip, SaType::Checkin).expect("load tip");
  assert_eq!(d.u.as_deref(), Some("alice"));
  assert_eq!(d.c.as_deref(), Some("egg"));
  assert!(d.d.is_some());
  assert_eq!(d.r.as_deref(), Some(silt::constants::MD5_EMPTY_HEX));
  let branch = d
    .t
    .iter()
    .find(|t| t.name == "branch")
    .expect("branch tag present");
  assert_eq!(branch.tag_type, TagType::Propagating);
  assert_eq!(branch.value.as_deref(), Some("trunk"));
  assert!(d
    .t
    .iter()
    .any(|t| t.name == "sym-trunk" && t.tag_type == TagType::Propagating));

  // The tip is a leaf on trunk.
  let leaf = f
    .db()
    .one_i64("SELECT 1 FROM repo.leaf WHERE rid=?1", [tip])
    .unwrap();
  assert_eq!(leaf, Some(1));
}

#[test]
fn reopen_loads_cached_state() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("r.fsl");
  let pc = {
    let mut f = Fossil::new().unwrap();
    repo::repo_create(
      &mut f,
      &RepoCreateOpts::new(&path).username("alice").commit_message("start"),
    )
    .unwrap();
    let pc = repo::config_get_text(&f, "project-code").unwrap().unwrap();
    repo::repo_close(&mut f).expect("close");
    pc
  };
  let mut f = Fossil::new().unwrap();
  repo::repo_open(&mut f, &path).expect("reopen");
  assert_eq!(
    repo::config_get_text(&f, "project-code").unwrap().unwrap(),
    pc
  );
  assert!(sym_to_rid(&f, "tip", SymFilter::Checkin).is_ok());
}

#[test]
fn open_refuses_non_repos_and_overwrite() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("not-a-repo.db");
  {
    // A plain SQLite file without the repository schema.
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE misc(x)").unwrap();
  }
  let mut f = Fossil::new().unwrap();
  let err = repo::repo_open(&mut f, &path).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotARepo);

  let err = repo::repo_open(&mut f, &dir.path().join("missing.fsl")).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);

  let mut f2 = Fossil::new().unwrap();
  repo::repo_create(&mut f2, &RepoCreateOpts::new(&path).username("x").allow_overwrite(true))
    .expect("overwrite allowed");
  let mut f3 = Fossil::new().unwrap();
  let err = repo::repo_create(&mut f3, &RepoCreateOpts::new(&path).username("x")).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn schema_version_mismatch_is_dedicated_error() {
  let dir = tempfile::tempdir().expect("tempdir");
  let path = dir.path().join("r.fsl");
  {
    let mut f = Fossil::new().unwrap();
    repo::repo_create(&mut f, &RepoCreateOpts::new(&path).username("x")).unwrap();
    repo::config_set_text(&f, "content-schema", "9").unwrap();
    repo::repo_close(&mut f).unwrap();
  }
  let mut f = Fossil::new().unwrap();
  let err = repo::repo_open(&mut f, &path).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::RepoVersion);
}

#[test]
fn fingerprint_round_trip() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = new_repo(dir.path(), Some("start"));
  let ck = dir.path().join("work");
  repo::ckout_create(&mut f, &ck, repo::OverwritePolicy::Error).expect("ckout");
  fingerprint_write(&mut f).expect("write fingerprint");
  ckout_fingerprint_check(&f).expect("fingerprint matches");

  // A replaced rcvfrom history must be detected.
  f.db()
    .exec("UPDATE repo.rcvfrom SET nonce=lower(hex(randomblob(20)))", [])
    .unwrap();
  let err = ckout_fingerprint_check(&f).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::RepoMismatch);
}
