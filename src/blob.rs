//! The content-addressed blob store.
//!
//! Blobs live in `repo.blob`, keyed locally by rid and globally by the hash
//! of their uncompressed content. Content may be stored plain (framed
//! zlib) or as a delta against another blob (`repo.delta` links). A blob
//! whose bytes have not arrived yet is a phantom: `size<0`, NULL content.

use rusqlite::Connection;
use tracing::{debug, trace, warn};

use crate::constants::{
  BLOB_SIZE_LIMIT, DELTA_CHAIN_CACHE_STEP, DELTA_CHAIN_LIMIT, DELTA_MAX_RATIO_DEN,
  DELTA_MAX_RATIO_NUM, DELTA_MIN_CONTENT, STRLEN_SHA1,
};
use crate::context::Fossil;
use crate::db::DbRole;
use crate::delta;
use crate::error::{ErrorKind, Result, SiltError};
use crate::hash::{self, HashAlgo};
use crate::util::compression;

// ============================================================================
// Hash policy
// ============================================================================

/// Governs which algorithm names new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashPolicy {
  /// SHA-1 only.
  Sha1,
  /// SHA-1 until the repository contains any SHA-3 hash, then SHA-3.
  #[default]
  Auto,
  /// Prefer SHA-3, accept SHA-1 lookups.
  Sha3,
  /// Refuse to emit SHA-1 hashes entirely.
  Sha3Only,
  /// Like Sha3Only, and report every SHA-1 hash as shunned.
  ShunSha1,
}

impl HashPolicy {
  pub fn config_name(self) -> &'static str {
    match self {
      HashPolicy::Sha1 => "sha1",
      HashPolicy::Auto => "auto",
      HashPolicy::Sha3 => "sha3",
      HashPolicy::Sha3Only => "sha3-only",
      HashPolicy::ShunSha1 => "shun-sha1",
    }
  }

  pub fn from_config_name(name: &str) -> Option<Self> {
    Some(match name {
      "sha1" => HashPolicy::Sha1,
      "auto" => HashPolicy::Auto,
      "sha3" => HashPolicy::Sha3,
      "sha3-only" => HashPolicy::Sha3Only,
      "shun-sha1" => HashPolicy::ShunSha1,
      _ => return None,
    })
  }
}

/// Resolve Auto against the repository's current contents.
fn effective_policy(f: &Fossil) -> Result<HashPolicy> {
  let p = f.hash_policy();
  if p != HashPolicy::Auto {
    return Ok(p);
  }
  let has_sha3 = f
    .db()
    .one_i64("SELECT 1 FROM repo.blob WHERE length(uuid)=64 LIMIT 1", [])?
    .is_some();
  Ok(if has_sha3 { HashPolicy::Sha3 } else { HashPolicy::Sha1 })
}

/// (primary, alternate) algorithms under a resolved policy.
fn policy_algos(p: HashPolicy) -> (HashAlgo, Option<HashAlgo>) {
  match p {
    HashPolicy::Sha1 => (HashAlgo::Sha1, Some(HashAlgo::Sha3)),
    HashPolicy::Auto => (HashAlgo::Sha1, Some(HashAlgo::Sha3)),
    HashPolicy::Sha3 => (HashAlgo::Sha3, Some(HashAlgo::Sha1)),
    HashPolicy::Sha3Only | HashPolicy::ShunSha1 => (HashAlgo::Sha3, None),
  }
}

/// Is this hash blocked from storage? `ShunSha1` blocks every 40-char hash
/// regardless of the shun table.
pub fn uuid_is_shunned(f: &Fossil, uuid: &str) -> Result<bool> {
  if f.hash_policy() == HashPolicy::ShunSha1 && uuid.len() == STRLEN_SHA1 {
    return Ok(true);
  }
  Ok(
    f.db()
      .one_i64("SELECT 1 FROM repo.shun WHERE uuid=?1", [uuid])?
      .is_some(),
  )
}

// ============================================================================
// Lookups
// ============================================================================

/// rid for a full uuid, if present.
pub fn uuid_to_rid(f: &Fossil, uuid: &str) -> Result<Option<i64>> {
  Ok(
    f.db()
      .one_i64("SELECT rid FROM repo.blob WHERE uuid=?1", [uuid])?,
  )
}

/// uuid for a rid, if present.
pub fn rid_to_uuid(f: &Fossil, rid: i64) -> Result<Option<String>> {
  Ok(
    f.db()
      .one_text("SELECT uuid FROM repo.blob WHERE rid=?1", [rid])?,
  )
}

/// Uncompressed size, `None` for phantoms and unknown rids.
pub fn content_size(f: &Fossil, rid: i64) -> Result<Option<i64>> {
  let size = f
    .db()
    .one_i64("SELECT size FROM repo.blob WHERE rid=?1", [rid])?;
  Ok(size.filter(|s| *s >= 0))
}

/// Content bytes exist (not a phantom)?
pub fn content_is_available(f: &Fossil, rid: i64) -> Result<bool> {
  Ok(content_size(f, rid)?.is_some())
}

pub fn content_is_private(f: &Fossil, rid: i64) -> Result<bool> {
  Ok(
    f.db()
      .one_i64("SELECT 1 FROM repo.private WHERE rid=?1", [rid])?
      .is_some(),
  )
}

/// The one legal privacy transition.
pub fn content_make_public(f: &Fossil, rid: i64) -> Result<()> {
  f.db()
    .exec("DELETE FROM repo.private WHERE rid=?1", [rid])?;
  Ok(())
}

// ============================================================================
// Receive batches
// ============================================================================

/// The active receive batch id, creating one on first use.
fn rcvid(f: &mut Fossil) -> Result<i64> {
  if f.cache.rcvid > 0 {
    return Ok(f.cache.rcvid);
  }
  let uid = match f.user() {
    Some(u) => f
      .db()
      .one_i64("SELECT uid FROM repo.user WHERE login=?1", [u])?,
    None => None,
  };
  f.db().exec(
    "INSERT INTO repo.rcvfrom(uid, mtime, nonce, ipaddr)
     VALUES (?1, julianday('now'), lower(hex(randomblob(20))), NULL)",
    [uid],
  )?;
  f.cache.rcvid = f.db().conn().last_insert_rowid();
  Ok(f.cache.rcvid)
}

// ============================================================================
// Phantoms
// ============================================================================

/// Create a phantom record for `uuid`: hash known, content absent.
/// Returns the existing rid when the hash is already present.
pub fn content_new(f: &mut Fossil, uuid: &str, private: bool) -> Result<i64> {
  if !hash::is_uuid(uuid) {
    return Err(SiltError::misuse(format!("not a full hash: {uuid:?}")));
  }
  if let Some(rid) = uuid_to_rid(f, uuid)? {
    return Ok(rid);
  }
  f.begin()?;
  let rc = (|| -> Result<i64> {
    f.db().exec(
      "INSERT INTO repo.blob(rcvid, size, uuid, content) VALUES (0, -1, ?1, NULL)",
      [uuid],
    )?;
    let rid = f.db().conn().last_insert_rowid();
    f.db()
      .exec("INSERT OR IGNORE INTO repo.phantom(rid) VALUES (?1)", [rid])?;
    if private {
      f.db()
        .exec("INSERT OR IGNORE INTO repo.private(rid) VALUES (?1)", [rid])?;
    } else {
      f.db().exec(
        "INSERT OR IGNORE INTO repo.unclustered(rid) VALUES (?1)",
        [rid],
      )?;
    }
    Ok(rid)
  })();
  f.end(rc.is_ok())?;
  let rid = rc?;
  f.cache.bags.mark_missing(rid);
  trace!(rid, uuid, "phantom created");
  Ok(rid)
}

// ============================================================================
// Put
// ============================================================================

/// Extra inputs for [`content_put_ex`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOpts<'a> {
  /// Known hash of the (uncompressed) content. Computed when absent.
  pub uuid: Option<&'a str>,
  /// Store the content as a delta against this blob.
  pub srcid: Option<i64>,
  /// The passed bytes are already framed-compressed.
  pub is_compressed: bool,
  /// Uncompressed size; required with `is_compressed`.
  pub uncompressed_size: Option<i64>,
  /// Keep the blob out of the sync-visible set.
  pub private: bool,
}

/// Result of a put: the blob's local and global identity.
#[derive(Debug, Clone)]
pub struct Saved {
  pub rid: i64,
  pub uuid: String,
}

/// Insert content under the context's hash policy.
pub fn content_put(f: &mut Fossil, content: &[u8]) -> Result<Saved> {
  content_put_ex(f, content, &PutOpts::default())
}

/// Hash selection for new content: try the policy's alternate algorithm
/// first and reuse its hash when the repository already names content with
/// it; otherwise hash with the primary.
fn hash_for_put(f: &Fossil, content: &[u8]) -> Result<String> {
  let policy = effective_policy(f)?;
  let (primary, alternate) = policy_algos(policy);
  if let Some(alt) = alternate {
    let alt_hash = hash::hash_hex(alt, content);
    if uuid_to_rid(f, &alt_hash)?.is_some() {
      return Ok(alt_hash);
    }
  }
  Ok(hash::hash_hex(primary, content))
}

pub fn content_put_ex(f: &mut Fossil, content: &[u8], opts: &PutOpts<'_>) -> Result<Saved> {
  if !f.db().is_attached(DbRole::Repo) {
    return Err(SiltError::new(ErrorKind::NotARepo, "no repository is attached"));
  }
  if opts.is_compressed && (opts.uuid.is_none() || opts.uncompressed_size.is_none()) {
    return Err(SiltError::misuse(
      "pre-compressed content requires uuid and uncompressed_size",
    ));
  }
  let size = opts
    .uncompressed_size
    .unwrap_or(content.len() as i64);
  if size > BLOB_SIZE_LIMIT {
    return Err(SiltError::range(format!(
      "content size {size} exceeds the {BLOB_SIZE_LIMIT}-byte ceiling"
    )));
  }
  let uuid = match opts.uuid {
    Some(u) => {
      if !hash::is_uuid(u) {
        return Err(SiltError::misuse(format!("not a full hash: {u:?}")));
      }
      u.to_string()
    }
    None => hash_for_put(f, content)?,
  };

  let batch = rcvid(f)?;
  f.begin()?;
  let rc = (|| -> Result<(i64, bool)> {
    let row: Option<(i64, i64)> = {
      let db = f.db();
      let mut stmt = db.conn().prepare("SELECT rid, size FROM repo.blob WHERE uuid=?1")?;
      let mut rows = stmt.query([&uuid])?;
      match rows.next()? {
        Some(r) => Some((r.get(0)?, r.get(1)?)),
        None => None,
      }
    };
    match row {
      Some((rid, old_size)) if old_size >= 0 => {
        // Already have this content; nothing to do.
        Ok((rid, false))
      }
      Some((rid, _phantom)) => {
        // Fill the phantom in place.
        let stored: Vec<u8> = if opts.is_compressed {
          content.to_vec()
        } else {
          compression::compress(content)?
        };
        f.db().exec(
          "UPDATE repo.blob SET rcvid=?1, size=?2, content=?3 WHERE rid=?4",
          rusqlite::params![batch, size, stored, rid],
        )?;
        f.db().exec("DELETE FROM repo.phantom WHERE rid=?1", [rid])?;
        if let Some(srcid) = opts.srcid {
          f.db().exec(
            "INSERT OR REPLACE INTO repo.delta(rid, srcid) VALUES (?1, ?2)",
            [rid, srcid],
          )?;
        }
        f.cache.verify_rids.push(rid);
        Ok((rid, true))
      }
      None => {
        let stored: Vec<u8> = if opts.is_compressed {
          content.to_vec()
        } else {
          compression::compress(content)?
        };
        f.db().exec(
          "INSERT INTO repo.blob(rcvid, size, uuid, content) VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![batch, size, uuid, stored],
        )?;
        let rid = f.db().conn().last_insert_rowid();
        if let Some(srcid) = opts.srcid {
          f.db().exec(
            "INSERT OR REPLACE INTO repo.delta(rid, srcid) VALUES (?1, ?2)",
            [rid, srcid],
          )?;
        }
        if opts.private {
          f.db()
            .exec("INSERT INTO repo.private(rid) VALUES (?1)", [rid])?;
        } else {
          f.db().exec(
            "INSERT OR IGNORE INTO repo.unclustered(rid) VALUES (?1)",
            [rid],
          )?;
          f.db()
            .exec("INSERT OR IGNORE INTO repo.unsent(rid) VALUES (?1)", [rid])?;
        }
        f.cache.verify_rids.push(rid);
        Ok((rid, false))
      }
    }
  })();
  match rc {
    Ok((rid, was_phantom)) => {
      f.end(true)?;
      f.cache.bags.mark_available(rid);
      f.cache.content.insert(rid, content_bytes_for_cache(content, opts)?);
      if was_phantom {
        debug!(rid, uuid = %uuid, "phantom filled");
        crate::xlink::after_dephantomize(f, rid)?;
      }
      Ok(Saved { rid, uuid })
    }
    Err(e) => {
      f.end(false)?;
      Err(e)
    }
  }
}

fn content_bytes_for_cache(content: &[u8], opts: &PutOpts<'_>) -> Result<Vec<u8>> {
  if opts.is_compressed {
    compression::uncompress(content)
  } else {
    Ok(content.to_vec())
  }
}

// ============================================================================
// Get
// ============================================================================

/// Load the raw stored row for `rid`.
fn load_stored(conn: &Connection, rid: i64) -> Result<Option<(i64, Option<Vec<u8>>)>> {
  let mut stmt = conn.prepare("SELECT size, content FROM repo.blob WHERE rid=?1")?;
  let mut rows = stmt.query([rid])?;
  match rows.next()? {
    Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
    None => Ok(None),
  }
}

fn delta_src(conn: &Connection, rid: i64) -> Result<Option<i64>> {
  let mut stmt = conn.prepare("SELECT srcid FROM repo.delta WHERE rid=?1")?;
  let mut rows = stmt.query([rid])?;
  match rows.next()? {
    Some(row) => Ok(Some(row.get(0)?)),
    None => Ok(None),
  }
}

/// Uncompressed stored bytes of one row, delta form or not.
fn load_leaf_bytes(conn: &Connection, rid: i64) -> Result<Vec<u8>> {
  match load_stored(conn, rid)? {
    None => Err(SiltError::not_found(format!("no blob with rid {rid}"))),
    Some((size, _)) if size < 0 => Err(SiltError::new(
      ErrorKind::Phantom,
      format!("cannot fetch content for phantom blob {rid}"),
    )),
    Some((_, None)) => Err(SiltError::consistency(format!(
      "blob {rid} has a size but no content"
    ))),
    Some((_, Some(bytes))) => compression::uncompress_if_needed(&bytes),
  }
}

/// Reconstruct content by walking the delta chain, no context caches.
/// This is the UDF-facing path; [`content_get`] layers caching on top.
pub fn content_get_raw(conn: &Connection, rid: i64) -> Result<Vec<u8>> {
  reconstruct(conn, rid, None)
}

fn reconstruct(
  conn: &Connection,
  rid: i64,
  mut cache: Option<&mut crate::cache::ContentCache>,
) -> Result<Vec<u8>> {
  // Collect the chain from rid to its baseline, detecting cycles.
  let mut chain = vec![rid];
  let mut seen = std::collections::HashSet::from([rid]);
  let mut cursor = rid;
  let baseline_from_cache;
  loop {
    if let Some(c) = cache.as_deref_mut() {
      if c.get(cursor).is_some() && cursor != rid {
        baseline_from_cache = true;
        break;
      }
    }
    match delta_src(conn, cursor)? {
      Some(src) => {
        if !seen.insert(src) {
          return Err(SiltError::consistency(format!(
            "delta chain cycle at blob {src}"
          )));
        }
        if chain.len() >= DELTA_CHAIN_LIMIT {
          return Err(SiltError::consistency(format!(
            "delta chain through blob {rid} exceeds {DELTA_CHAIN_LIMIT} links"
          )));
        }
        chain.push(src);
        cursor = src;
      }
      None => {
        baseline_from_cache = false;
        break;
      }
    }
  }

  // chain = [rid, ..., baseline]; reconstruct top-down.
  let base = *chain.last().expect("chain is never empty");
  let mut buf = if baseline_from_cache {
    cache
      .as_deref_mut()
      .and_then(|c| c.get(base).map(|b| b.to_vec()))
      .expect("cache entry vanished")
  } else {
    load_leaf_bytes(conn, base)?
  };
  for (steps, &link) in chain.iter().rev().skip(1).enumerate() {
    let delta_bytes = load_leaf_bytes(conn, link)?;
    buf = delta::apply(&buf, &delta_bytes)?;
    if let Some(c) = cache.as_deref_mut() {
      if (steps + 1) % DELTA_CHAIN_CACHE_STEP == 0 && link != rid {
        c.insert(link, buf.clone());
      }
    }
  }
  Ok(buf)
}

/// Fetch (reconstructing as needed) the uncompressed content of `rid`.
pub fn content_get(f: &mut Fossil, rid: i64) -> Result<Vec<u8>> {
  if rid <= 0 {
    return Err(SiltError::range(format!("invalid rid {rid}")));
  }
  if f.cache.bags.missing.contains(&rid) {
    return Err(SiltError::not_found(format!("no blob with rid {rid}")));
  }
  if let Some(bytes) = f.cache.content.get(rid) {
    return Ok(bytes.to_vec());
  }
  let Fossil { db, cache, .. } = f;
  match reconstruct(db.conn(), rid, Some(&mut cache.content)) {
    Ok(bytes) => {
      cache.bags.mark_available(rid);
      cache.content.insert(rid, bytes.clone());
      Ok(bytes)
    }
    Err(e) => {
      if e.kind() == ErrorKind::NotFound {
        cache.bags.mark_missing(rid);
      }
      Err(e)
    }
  }
}

/// Fetch content by symbol.
pub fn content_get_sym(f: &mut Fossil, sym: &str) -> Result<Vec<u8>> {
  let rid = crate::resolver::sym_to_rid(f, sym, crate::resolver::SymFilter::Any)?;
  content_get(f, rid)
}

// ============================================================================
// Deltification
// ============================================================================

/// Does the chain starting at `rid` pass through `needle`?
fn chain_reaches(conn: &Connection, rid: i64, needle: i64) -> Result<bool> {
  let mut cursor = rid;
  let mut hops = 0usize;
  while let Some(src) = delta_src(conn, cursor)? {
    if src == needle {
      return Ok(true);
    }
    hops += 1;
    if hops > DELTA_CHAIN_LIMIT {
      return Err(SiltError::consistency(format!(
        "delta chain through blob {rid} exceeds {DELTA_CHAIN_LIMIT} links"
      )));
    }
    cursor = src;
  }
  Ok(false)
}

/// Store `rid` as a delta against `srcid` when the delta pays for itself.
pub fn content_deltify(f: &mut Fossil, rid: i64, srcid: i64, force: bool) -> Result<()> {
  if rid == srcid {
    return Ok(());
  }
  if !force && delta_src(f.db().conn(), rid)?.is_some() {
    return Ok(());
  }
  // A public blob must never ride on a private baseline.
  if content_is_private(f, srcid)? && !content_is_private(f, rid)? {
    trace!(rid, srcid, "deltify skipped: would cross the private boundary");
    return Ok(());
  }
  // Re-rooting the source onto rid would create a cycle.
  if chain_reaches(f.db().conn(), srcid, rid)? {
    content_undeltify(f, srcid)?;
  }
  let src_size = content_size(f, srcid)?.unwrap_or(0);
  let rid_size = content_size(f, rid)?.unwrap_or(0);
  if src_size < DELTA_MIN_CONTENT || rid_size < DELTA_MIN_CONTENT {
    return Ok(());
  }
  let src = content_get(f, srcid)?;
  let data = content_get(f, rid)?;
  let d = delta::create(&src, &data);
  if (d.len() as u64) * DELTA_MAX_RATIO_DEN > (data.len() as u64) * DELTA_MAX_RATIO_NUM {
    trace!(rid, srcid, "deltify skipped: delta too large");
    return Ok(());
  }
  let stored = compression::compress(&d)?;
  f.begin()?;
  let rc = (|| -> Result<()> {
    f.db().exec(
      "UPDATE repo.blob SET content=?1 WHERE rid=?2",
      rusqlite::params![stored, rid],
    )?;
    f.db().exec(
      "INSERT OR REPLACE INTO repo.delta(rid, srcid) VALUES (?1, ?2)",
      [rid, srcid],
    )?;
    Ok(())
  })();
  f.end(rc.is_ok())?;
  rc?;
  debug!(rid, srcid, delta_len = d.len(), "blob deltified");
  Ok(())
}

/// Restore `rid` to plain (non-delta) storage. Idempotent.
pub fn content_undeltify(f: &mut Fossil, rid: i64) -> Result<()> {
  if delta_src(f.db().conn(), rid)?.is_none() {
    return Ok(());
  }
  let content = content_get(f, rid)?;
  let stored = compression::compress(&content)?;
  f.begin()?;
  let rc = (|| -> Result<()> {
    f.db().exec(
      "UPDATE repo.blob SET content=?1, size=?2 WHERE rid=?3",
      rusqlite::params![stored, content.len() as i64, rid],
    )?;
    f.db().exec("DELETE FROM repo.delta WHERE rid=?1", [rid])?;
    Ok(())
  })();
  f.end(rc.is_ok())?;
  rc
}

// ============================================================================
// Commit-time verification
// ============================================================================

/// Re-hash every blob queued during this transaction and compare against
/// its recorded uuid. The algorithm follows the stored hash's length, so a
/// SHA-1-named blob is re-checked as SHA-1 even under a SHA-3 policy.
pub fn verify_before_commit(f: &mut Fossil) -> Result<()> {
  let rids = std::mem::take(&mut f.cache.verify_rids);
  for rid in rids {
    let Some(uuid) = rid_to_uuid(f, rid)? else {
      return Err(SiltError::consistency(format!(
        "queued blob {rid} vanished before commit"
      )));
    };
    let algo = HashAlgo::of_uuid(&uuid).ok_or_else(|| {
      SiltError::consistency(format!("blob {rid} has a malformed uuid {uuid:?}"))
    })?;
    let content = content_get(f, rid)?;
    let actual = hash::hash_hex(algo, &content);
    if actual != uuid {
      warn!(rid, expected = %uuid, got = %actual, "content verification failed");
      return Err(SiltError::consistency(format!(
        "blob {rid} hash mismatch: recorded {uuid}, content hashes to {actual}"
      )));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::repo::{repo_create, RepoCreateOpts};

  fn test_repo() -> (tempfile::TempDir, Fossil) {
    let dir = tempfile::tempdir().unwrap();
    let mut f = Fossil::new().unwrap();
    repo_create(
      &mut f,
      &RepoCreateOpts::new(dir.path().join("r.fsl")).username("tester"),
    )
    .unwrap();
    (dir, f)
  }

  #[test]
  fn test_put_is_idempotent() {
    let (_d, mut f) = test_repo();
    let a = content_put(&mut f, b"some tracked bytes").unwrap();
    let b = content_put(&mut f, b"some tracked bytes").unwrap();
    assert_eq!(a.rid, b.rid);
    assert_eq!(a.uuid, b.uuid);
    let n = f
      .db()
      .one_i64("SELECT count(*) FROM repo.blob WHERE uuid=?1", [&a.uuid])
      .unwrap();
    assert_eq!(n, Some(1));
  }

  #[test]
  fn test_get_returns_put_bytes() {
    let (_d, mut f) = test_repo();
    let payload = b"content that should round-trip unchanged\n".to_vec();
    let saved = content_put(&mut f, &payload).unwrap();
    assert_eq!(content_get(&mut f, saved.rid).unwrap(), payload);
    // A second read hits the cache.
    assert_eq!(content_get(&mut f, saved.rid).unwrap(), payload);
  }

  #[test]
  fn test_deltify_preserves_content() {
    let (_d, mut f) = test_repo();
    let b0 = vec![b'x'; 10_000];
    let mut b1 = b0.clone();
    b1.push(b'Y');
    let s0 = content_put(&mut f, &b0).unwrap();
    let s1 = content_put(&mut f, &b1).unwrap();
    content_deltify(&mut f, s1.rid, s0.rid, false).unwrap();
    // Stored form is now a small delta.
    let stored = f
      .db()
      .one_blob("SELECT content FROM repo.blob WHERE rid=?1", [s1.rid])
      .unwrap()
      .unwrap();
    assert!(stored.len() < b1.len() / 4);
    f.cache.content.clear();
    assert_eq!(content_get(&mut f, s1.rid).unwrap(), b1);
    content_undeltify(&mut f, s1.rid).unwrap();
    f.cache.content.clear();
    assert_eq!(content_get(&mut f, s1.rid).unwrap(), b1);
  }

  #[test]
  fn test_phantom_fill_cycle() {
    let (_d, mut f) = test_repo();
    let payload = b"bytes that arrive later".to_vec();
    let uuid = crate::hash::sha3_hex(&payload);
    let rid = content_new(&mut f, &uuid, false).unwrap();
    assert!(!content_is_available(&f, rid).unwrap());
    assert_eq!(
      content_get(&mut f, rid).unwrap_err().kind(),
      ErrorKind::Phantom
    );
    let saved = content_put_ex(
      &mut f,
      &payload,
      &PutOpts {
        uuid: Some(&uuid),
        ..Default::default()
      },
    )
    .unwrap();
    assert_eq!(saved.rid, rid);
    assert!(content_is_available(&f, rid).unwrap());
    assert_eq!(content_get(&mut f, rid).unwrap(), payload);
    let phantom_rows = f
      .db()
      .one_i64("SELECT count(*) FROM repo.phantom WHERE rid=?1", [rid])
      .unwrap();
    assert_eq!(phantom_rows, Some(0));
  }

  #[test]
  fn test_delta_cycle_is_consistency_error() {
    let (_d, mut f) = test_repo();
    let a = content_put(&mut f, &vec![b'a'; 100]).unwrap();
    let b = content_put(&mut f, &vec![b'b'; 100]).unwrap();
    // Corrupt the store into a two-node cycle.
    f.db()
      .exec(
        "INSERT OR REPLACE INTO repo.delta(rid, srcid) VALUES (?1, ?2)",
        [a.rid, b.rid],
      )
      .unwrap();
    f.db()
      .exec(
        "INSERT OR REPLACE INTO repo.delta(rid, srcid) VALUES (?1, ?2)",
        [b.rid, a.rid],
      )
      .unwrap();
    f.cache.content.clear();
    f.cache.bags.clear();
    let err = content_get(&mut f, a.rid).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert!(err.message().contains("cycle"));
  }

  #[test]
  fn test_verification_catches_tampering() {
    let (_d, mut f) = test_repo();
    f.begin().unwrap();
    let saved = content_put(&mut f, b"honest content").unwrap();
    // Corrupt the stored bytes before the outer commit.
    let fake = crate::util::compression::compress(b"tampered").unwrap();
    f.db()
      .exec(
        "UPDATE repo.blob SET content=?1, size=8 WHERE rid=?2",
        rusqlite::params![fake, saved.rid],
      )
      .unwrap();
    f.cache.content.clear();
    let err = f.end(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert!(err.message().contains(&saved.uuid));
  }

  #[test]
  fn test_shun_policy() {
    let (_d, mut f) = test_repo();
    let sha1ish = "a".repeat(40);
    assert!(!uuid_is_shunned(&f, &sha1ish).unwrap());
    f.config.hash_policy = HashPolicy::ShunSha1;
    assert!(uuid_is_shunned(&f, &sha1ish).unwrap());
    assert!(!uuid_is_shunned(&f, &"a".repeat(64)).unwrap());
  }
}
