//! Working-directory flows: add-and-commit, checkout no-op, update with
//! conflict, revert.

use std::path::Path;

use silt::checkout::{
  changes_scan, checkin_commit, ckout_has_changes, ckout_update, manage, repo_ckout, revert,
  unmanage, CkoutOpts, CommitOpts, FileChangeType, ManageOpt, RevertAction, RevertOpt, ScanFlags,
  UnmanageOpt, UpdateOpts,
};
use silt::deck::SaType;
use silt::repo::{self, RepoCreateOpts};
use silt::resolver::{sym_to_rid, SymFilter};
use silt::Fossil;

/// A repository with an initial commit plus a checkout directory, checked
/// out at the initial version.
fn repo_with_ckout(dir: &Path) -> Fossil {
  let mut f = Fossil::new().expect("context");
  repo::repo_create(
    &mut f,
    &RepoCreateOpts::new(dir.join("r.fsl"))
      .username("alice")
      .commit_message("start"),
  )
  .expect("repo_create");
  let work = dir.join("work");
  repo::ckout_create(&mut f, &work, repo::OverwritePolicy::Error).expect("ckout_create");
  let tip = sym_to_rid(&f, "tip", SymFilter::Checkin).expect("tip");
  repo_ckout(&mut f, &mut CkoutOpts::new(tip)).expect("initial checkout");
  f
}

fn work_dir(f: &Fossil) -> std::path::PathBuf {
  f.ckout().expect("checkout open").dir.clone()
}

#[test]
fn add_and_commit_scenario() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = repo_with_ckout(dir.path());
  let work = work_dir(&f);
  let initial_uuid = f.ckout().unwrap().uuid.clone().expect("checkout uuid");

  std::fs::create_dir_all(work.join("a")).unwrap();
  std::fs::write(work.join("a/b.txt"), "hello\n").unwrap();
  let counts = manage(&mut f, &mut ManageOpt::new("a/b.txt")).expect("manage");
  assert_eq!(counts.added, 1);

  let saved = checkin_commit(&mut f, &CommitOpts::new("add b")).expect("commit");
  let mut d = silt::deck::load(&mut f, saved.rid, SaType::Checkin).expect("load");
  d.load_baseline(&mut f).unwrap();
  let cards: Vec<_> = d.fcards_effective().unwrap().into_iter().cloned().collect();
  assert_eq!(cards.len(), 1);
  assert_eq!(cards[0].name, "a/b.txt");
  assert_eq!(
    cards[0].uuid.as_deref(),
    Some(silt::hash::sha1_hex(b"hello\n").as_str())
  );
  assert_eq!(cards[0].perm, silt::deck::FilePerm::Regular);
  assert_eq!(d.p, vec![initial_uuid]);
  assert_eq!(d.c.as_deref(), Some("add b"));

  // Exactly one mlink row records the file.
  let mlinks = f
    .db()
    .one_i64("SELECT count(*) FROM repo.mlink WHERE mid=?1", [saved.rid])
    .unwrap()
    .unwrap();
  assert_eq!(mlinks, 1);
  assert!(!ckout_has_changes(&f).expect("clean after commit"));
}

#[test]
fn manage_then_unmanage_before_commit() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = repo_with_ckout(dir.path());
  let work = work_dir(&f);
  std::fs::write(work.join("stray.txt"), "data\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("stray.txt")).expect("manage");
  unmanage(&mut f, &UnmanageOpt::by_name("stray.txt")).expect("unmanage");
  let rows = f
    .db()
    .one_i64(
      "SELECT count(*) FROM ckout.vfile WHERE pathname='stray.txt'",
      [],
    )
    .unwrap()
    .unwrap();
  assert_eq!(rows, 0); // a never-committed row is dropped outright
}

#[test]
fn repeated_checkout_is_a_noop() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = repo_with_ckout(dir.path());
  let work = work_dir(&f);
  std::fs::write(work.join("f.txt"), "contents\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("f.txt")).expect("manage");
  let saved = checkin_commit(&mut f, &CommitOpts::new("one file")).expect("commit");

  let mut seen: Vec<(String, FileChangeType)> = Vec::new();
  let mut cb = |name: &str, ch: FileChangeType| -> silt::Result<()> {
    seen.push((name.to_string(), ch));
    Ok(())
  };
  let mut opts = CkoutOpts::new(saved.rid);
  opts.callback = Some(&mut cb);
  repo_ckout(&mut f, &mut opts).expect("re-checkout");
  assert!(!seen.is_empty());
  assert!(seen.iter().all(|(_, ch)| *ch == FileChangeType::None));
}

/// Build a child checkin of the current checkout version that sets `name`
/// to `content`, without touching the checkout.
fn commit_side_version(f: &mut Fossil, name: &str, content: &[u8]) -> i64 {
  let vid = f.ckout().unwrap().rid;
  let blob = silt::blob::content_put(f, content).expect("side blob");
  let mut d = silt::deck::load(f, vid, SaType::Checkin).expect("load parent");
  d.load_baseline(f).unwrap();
  d.derive(f).expect("derive");
  d.fcard_set(name, Some(&blob.uuid), silt::deck::FilePerm::Regular, None)
    .expect("fcard_set");
  d.set_comment("side edit").unwrap();
  d.set_date_julian(silt::util::time::julian_now()).unwrap();
  d.set_user("bob").unwrap();
  silt::deck::save(f, &mut d, false).expect("save side version").rid
}

#[test]
fn update_with_conflict_then_revert() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = repo_with_ckout(dir.path());
  let work = work_dir(&f);

  // Base version with F = "1\n2\n3\n".
  std::fs::write(work.join("F"), "1\n2\n3\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("F")).expect("manage");
  checkin_commit(&mut f, &CommitOpts::new("base")).expect("base commit");

  // Local edit and a competing target version.
  std::fs::write(work.join("F"), "1\nX\n3\n").unwrap();
  let tid = commit_side_version(&mut f, "F", b"1\nY\n3\n");

  let mut seen: Vec<(String, FileChangeType)> = Vec::new();
  let mut cb = |name: &str, ch: FileChangeType| -> silt::Result<()> {
    seen.push((name.to_string(), ch));
    Ok(())
  };
  let mut opts = UpdateOpts::new(tid);
  opts.callback = Some(&mut cb);
  ckout_update(&mut f, &mut opts).expect("update");

  assert!(seen
    .iter()
    .any(|(n, ch)| n == "F" && *ch == FileChangeType::ConflictMerged));
  let merged = std::fs::read_to_string(work.join("F")).unwrap();
  assert!(merged.contains("BEGIN MERGE CONFLICT"));
  assert!(merged.contains("\nX\n"));
  assert!(merged.contains("\nY\n"));
  assert!(ckout_has_changes(&f).expect("conflicted checkout has changes"));

  // Revert restores the checked-out (target) content.
  let mut reverted: Vec<(String, RevertAction)> = Vec::new();
  let mut rcb = |name: &str, action: RevertAction| -> silt::Result<bool> {
    reverted.push((name.to_string(), action));
    Ok(true)
  };
  let mut ropts = RevertOpt {
    filename: Some("F".into()),
    scan_for_changes: true,
    callback: Some(&mut rcb),
  };
  revert(&mut f, &mut ropts).expect("revert");
  assert_eq!(std::fs::read_to_string(work.join("F")).unwrap(), "1\nY\n3\n");
  assert!(reverted
    .iter()
    .any(|(n, a)| n == "F" && *a == RevertAction::Contents));
  let chnged = f
    .db()
    .one_i64("SELECT chnged FROM ckout.vfile WHERE pathname='F'", [])
    .unwrap()
    .unwrap();
  assert_eq!(chnged, 0);
}

#[test]
fn update_carries_clean_and_added_files() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = repo_with_ckout(dir.path());
  let work = work_dir(&f);

  std::fs::write(work.join("keep.txt"), "same\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("keep.txt")).expect("manage");
  checkin_commit(&mut f, &CommitOpts::new("base")).expect("commit");

  // Target adds a second file; local adds a third, uncommitted.
  let tid = commit_side_version(&mut f, "from-target.txt", b"incoming\n");
  std::fs::write(work.join("local-add.txt"), "mine\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("local-add.txt")).expect("manage local add");

  let mut seen: Vec<(String, FileChangeType)> = Vec::new();
  let mut cb = |name: &str, ch: FileChangeType| -> silt::Result<()> {
    seen.push((name.to_string(), ch));
    Ok(())
  };
  let mut opts = UpdateOpts::new(tid);
  opts.callback = Some(&mut cb);
  ckout_update(&mut f, &mut opts).expect("update");

  assert_eq!(
    std::fs::read_to_string(work.join("from-target.txt")).unwrap(),
    "incoming\n"
  );
  assert!(seen
    .iter()
    .any(|(n, ch)| n == "from-target.txt" && *ch == FileChangeType::Added));
  assert!(seen
    .iter()
    .any(|(n, ch)| n == "local-add.txt" && *ch == FileChangeType::AddPropagated));
  // The carried-over add still lives in vfile with rid=0.
  let added = f
    .db()
    .one_i64(
      "SELECT count(*) FROM ckout.vfile WHERE pathname='local-add.txt' AND rid=0",
      [],
    )
    .unwrap()
    .unwrap();
  assert_eq!(added, 1);
}

#[test]
fn scan_detects_edits_and_reverts_see_them() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = repo_with_ckout(dir.path());
  let work = work_dir(&f);

  std::fs::write(work.join("notes.md"), "v1\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("notes.md")).expect("manage");
  checkin_commit(&mut f, &CommitOpts::new("notes")).expect("commit");
  assert!(!ckout_has_changes(&f).unwrap());

  std::fs::write(work.join("notes.md"), "v2 edited\n").unwrap();
  let vid = f.ckout().unwrap().rid;
  changes_scan(&mut f, vid, ScanFlags::empty()).expect("scan");
  assert!(ckout_has_changes(&f).unwrap());

  revert(&mut f, &mut RevertOpt::default()).expect("revert all");
  assert_eq!(
    std::fs::read_to_string(work.join("notes.md")).unwrap(),
    "v1\n"
  );
  assert!(!ckout_has_changes(&f).unwrap());
}
