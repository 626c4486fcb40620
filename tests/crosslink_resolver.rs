//! Derived-table invariants, rebuild idempotence, and symbol resolution.

use std::collections::BTreeSet;

use silt::checkout::{checkin_commit, manage, repo_ckout, CkoutOpts, CommitOpts, ManageOpt};
use silt::repo::{self, RepoCreateOpts};
use silt::resolver::{sym_to_rid, sym_to_uuid, SymFilter};
use silt::{ErrorKind, Fossil};

/// Repository with three checkins touching two files.
fn build_history(dir: &std::path::Path) -> Fossil {
  let mut f = Fossil::new().expect("context");
  repo::repo_create(
    &mut f,
    &RepoCreateOpts::new(dir.join("r.fsl"))
      .username("alice")
      .commit_message("start"),
  )
  .expect("repo_create");
  let work = dir.join("work");
  repo::ckout_create(&mut f, &work, repo::OverwritePolicy::Error).expect("ckout");
  let tip = sym_to_rid(&f, "tip", SymFilter::Checkin).unwrap();
  repo_ckout(&mut f, &mut CkoutOpts::new(tip)).expect("checkout");

  std::fs::write(work.join("alpha.txt"), "alpha v1\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("alpha.txt")).unwrap();
  checkin_commit(&mut f, &CommitOpts::new("add alpha")).expect("c1");

  std::fs::write(work.join("alpha.txt"), "alpha v2\n").unwrap();
  std::fs::write(work.join("beta.txt"), "beta v1\n").unwrap();
  manage(&mut f, &mut ManageOpt::new("beta.txt")).unwrap();
  checkin_commit(&mut f, &CommitOpts::new("edit alpha, add beta")).expect("c2");
  f
}

fn table_snapshot(f: &Fossil, sql: &str) -> BTreeSet<String> {
  let mut out = BTreeSet::new();
  f.db()
    .each(sql, [], |row| {
      let mut parts = Vec::new();
      let mut i = 0;
      while let Ok(v) = row.get_ref(i) {
        parts.push(format!("{v:?}"));
        i += 1;
      }
      out.insert(parts.join("|"));
      Ok(())
    })
    .expect("snapshot query");
  out
}

#[test]
fn plink_mlink_leaf_invariants() {
  let dir = tempfile::tempdir().expect("tempdir");
  let f = build_history(dir.path());
  let tip = sym_to_rid(&f, "tip", SymFilter::Checkin).unwrap();

  // Exactly one primary parent edge per non-root checkin.
  let n = f
    .db()
    .one_i64(
      "SELECT count(*) FROM repo.plink WHERE cid=?1 AND isprim",
      [tip],
    )
    .unwrap()
    .unwrap();
  assert_eq!(n, 1);

  // c2 changed alpha and added beta: two mlink rows.
  let mlinks = f
    .db()
    .one_i64("SELECT count(*) FROM repo.mlink WHERE mid=?1", [tip])
    .unwrap()
    .unwrap();
  assert_eq!(mlinks, 2);

  // Only the tip is a leaf.
  let leaves: Vec<i64> = {
    let mut v = Vec::new();
    f.db()
      .each("SELECT rid FROM repo.leaf ORDER BY rid", [], |r| {
        v.push(r.get(0)?);
        Ok(())
      })
      .unwrap();
    v
  };
  assert_eq!(leaves, vec![tip]);

  // Every checkin inherited the trunk branch.
  let on_trunk = f
    .db()
    .one_i64(
      "SELECT count(*) FROM repo.tagxref x JOIN repo.tag t ON t.tagid=x.tagid
        WHERE t.tagname='branch' AND x.value='trunk' AND x.tagtype>0",
      [],
    )
    .unwrap()
    .unwrap();
  assert_eq!(on_trunk, 3);
}

#[test]
fn rebuild_reproduces_derived_tables() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = build_history(dir.path());

  let plink_sql = "SELECT pid, cid, isprim FROM repo.plink ORDER BY pid, cid";
  let mlink_sql =
    "SELECT mid, pid, fid, pfnid, mperm, isaux FROM repo.mlink ORDER BY mid, fid, pid";
  let event_sql = "SELECT type, objid, user, comment FROM repo.event ORDER BY objid";
  let leaf_sql = "SELECT rid FROM repo.leaf ORDER BY rid";
  let tagxref_sql =
    "SELECT tagtype, srcid, value, rid FROM repo.tagxref ORDER BY rid, tagtype, value";

  let before: Vec<BTreeSet<String>> = [plink_sql, mlink_sql, event_sql, leaf_sql, tagxref_sql]
    .iter()
    .map(|sql| table_snapshot(&f, sql))
    .collect();

  let stats = silt::xlink::rebuild(&mut f).expect("rebuild");
  assert_eq!(stats.artifacts_linked, 3);

  let after: Vec<BTreeSet<String>> = [plink_sql, mlink_sql, event_sql, leaf_sql, tagxref_sql]
    .iter()
    .map(|sql| table_snapshot(&f, sql))
    .collect();
  assert_eq!(before, after);

  // And a second rebuild is idempotent too.
  silt::xlink::rebuild(&mut f).expect("rebuild again");
  let again: Vec<BTreeSet<String>> = [plink_sql, mlink_sql, event_sql, leaf_sql, tagxref_sql]
    .iter()
    .map(|sql| table_snapshot(&f, sql))
    .collect();
  assert_eq!(before, again);
}

#[test]
fn resolver_forms() {
  let dir = tempfile::tempdir().expect("tempdir");
  let f = build_history(dir.path());
  let tip = sym_to_rid(&f, "tip", SymFilter::Checkin).unwrap();
  let (_, tip_uuid) = sym_to_uuid(&f, "tip", SymFilter::Checkin).unwrap();

  // Unique prefix resolution.
  let prefix = &tip_uuid[..8];
  assert_eq!(sym_to_rid(&f, prefix, SymFilter::Any).unwrap(), tip);
  // Full-hash fast path.
  assert_eq!(sym_to_rid(&f, &tip_uuid, SymFilter::Any).unwrap(), tip);
  // rid:N form.
  assert_eq!(
    sym_to_rid(&f, &format!("rid:{tip}"), SymFilter::Checkin).unwrap(),
    tip
  );
  // Tag forms: trunk names the newest trunk checkin.
  assert_eq!(sym_to_rid(&f, "tag:trunk", SymFilter::Checkin).unwrap(), tip);
  assert_eq!(sym_to_rid(&f, "trunk", SymFilter::Checkin).unwrap(), tip);
  // Checkout-relative.
  assert_eq!(sym_to_rid(&f, "current", SymFilter::Checkin).unwrap(), tip);
  let prev = sym_to_rid(&f, "prev", SymFilter::Checkin).unwrap();
  assert_ne!(prev, tip);
  // A far-future date resolves to the newest artifact.
  assert_eq!(
    sym_to_rid(&f, "date:2100-01-01", SymFilter::Checkin).unwrap(),
    tip
  );
  // Unknown names are UnknownResource, not Ambiguous.
  assert_eq!(
    sym_to_rid(&f, "no-such-thing", SymFilter::Any).unwrap_err().kind(),
    ErrorKind::UnknownResource
  );
}

#[test]
fn ambiguous_prefix_names_both_blobs() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = Fossil::new().unwrap();
  repo::repo_create(
    &mut f,
    &RepoCreateOpts::new(dir.path().join("r.fsl")).username("alice"),
  )
  .unwrap();

  // Hunt for two payloads whose hashes share a 4-hex prefix.
  let mut by_prefix: std::collections::HashMap<String, Vec<u8>> =
    std::collections::HashMap::new();
  let mut pair = None;
  for i in 0u32.. {
    let payload = format!("collision probe {i}\n").into_bytes();
    let h = silt::hash::sha1_hex(&payload);
    let prefix = h[..4].to_string();
    if let Some(first) = by_prefix.get(&prefix) {
      pair = Some((first.clone(), payload, prefix));
      break;
    }
    by_prefix.insert(prefix, payload);
  }
  let (a, b, prefix) = pair.expect("birthday search terminates");
  let sa = silt::blob::content_put(&mut f, &a).unwrap();
  let sb = silt::blob::content_put(&mut f, &b).unwrap();

  let err = sym_to_rid(&f, &prefix, SymFilter::Any).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Ambiguous);
  assert!(err.message().contains(&sa.uuid));
  assert!(err.message().contains(&sb.uuid));

  // One more hex digit disambiguates at least one of the two.
  let longer = &sa.uuid[..5];
  match sym_to_rid(&f, longer, SymFilter::Any) {
    Ok(rid) => assert_eq!(rid, sa.rid),
    Err(e) => assert_eq!(e.kind(), ErrorKind::Ambiguous),
  }
}

#[test]
fn phantom_fill_recrosslinks_waiting_artifacts() {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut f = build_history(dir.path());

  // Simulate a checkin that arrived before its file content: make a new
  // version referencing a blob we only know by hash.
  let future_content = b"gamma v1, not yet received\n".to_vec();
  let future_uuid = silt::hash::sha1_hex(&future_content);
  let vid = f.ckout().unwrap().rid;
  let mut d = silt::deck::load(&mut f, vid, silt::deck::SaType::Checkin).unwrap();
  d.load_baseline(&mut f).unwrap();
  d.derive(&mut f).unwrap();
  d.fcard_set("gamma.txt", Some(&future_uuid), silt::deck::FilePerm::Regular, None)
    .unwrap();
  d.set_comment("references missing content").unwrap();
  d.set_date_julian(silt::util::time::julian_now()).unwrap();
  d.set_user("alice").unwrap();
  let saved = silt::deck::save(&mut f, &mut d, false).unwrap();

  // Crosslinking created a phantom for the file.
  let frid = silt::blob::uuid_to_rid(&f, &future_uuid)
    .unwrap()
    .expect("phantom exists");
  assert!(!silt::blob::content_is_available(&f, frid).unwrap());
  let mlink_fid = f
    .db()
    .one_i64(
      "SELECT count(*) FROM repo.mlink WHERE mid=?1 AND fid=?2",
      [saved.rid, frid],
    )
    .unwrap()
    .unwrap();
  assert_eq!(mlink_fid, 1);

  // Filling the phantom keeps everything consistent.
  let filled = silt::blob::content_put(&mut f, &future_content).unwrap();
  assert_eq!(filled.rid, frid);
  assert!(silt::blob::content_is_available(&f, frid).unwrap());
  assert_eq!(
    silt::blob::content_get(&mut f, frid).unwrap(),
    future_content
  );
}
