//! SQL schema scripts for the three database roles.
//!
//! The repository splits into a static part (raw artifact storage, survives
//! a rebuild untouched) and a transient part (derived tables a rebuild drops
//! and reconstructs). The ticket pair is a template: a repository may carry
//! its own via the `ticket-table` config entry.

/// Repository, static half: the artifact store and bookkeeping that cannot
/// be reconstructed.
pub const REPO_SCHEMA_STATIC: &str = r#"
CREATE TABLE repo.blob(
  rid INTEGER PRIMARY KEY,
  rcvid INTEGER,
  size INTEGER,
  uuid TEXT UNIQUE NOT NULL,
  content BLOB,
  CHECK( length(uuid)>=40 AND rid>0 )
);
CREATE TABLE repo.delta(
  rid INTEGER PRIMARY KEY,
  srcid INTEGER NOT NULL REFERENCES blob
);
CREATE INDEX repo.delta_i1 ON delta(srcid);
CREATE TABLE repo.rcvfrom(
  rcvid INTEGER PRIMARY KEY,
  uid INTEGER REFERENCES user,
  mtime DATETIME,
  nonce TEXT UNIQUE,
  ipaddr TEXT
);
CREATE TABLE repo.private(
  rid INTEGER PRIMARY KEY
);
CREATE TABLE repo.user(
  uid INTEGER PRIMARY KEY,
  login TEXT UNIQUE,
  pw TEXT,
  cap TEXT,
  cookie TEXT,
  ipaddr TEXT,
  cexpire DATETIME,
  info TEXT,
  mtime DATE,
  photo BLOB
);
CREATE TABLE repo.config(
  name TEXT PRIMARY KEY NOT NULL,
  value CLOB,
  mtime DATE
) WITHOUT ROWID;
CREATE TABLE repo.shun(
  uuid TEXT PRIMARY KEY,
  mtime DATE,
  scom TEXT
) WITHOUT ROWID;
CREATE TABLE repo.reportfmt(
  rn INTEGER PRIMARY KEY,
  owner TEXT,
  title TEXT UNIQUE,
  mtime DATE,
  cols TEXT,
  sqlcode TEXT
);
"#;

/// Repository, transient half: everything `rebuild` drops and rebuilds from
/// the artifact set.
pub const REPO_SCHEMA_TRANSIENT: &str = r#"
CREATE TABLE repo.filename(
  fnid INTEGER PRIMARY KEY,
  name TEXT UNIQUE
);
CREATE TABLE repo.mlink(
  mid INTEGER,
  pid INTEGER,
  fid INTEGER,
  fnid INTEGER REFERENCES filename,
  pfnid INTEGER,
  mperm INTEGER,
  isaux BOOLEAN DEFAULT 0
);
CREATE INDEX repo.mlink_i1 ON mlink(mid);
CREATE INDEX repo.mlink_i2 ON mlink(fnid);
CREATE INDEX repo.mlink_i3 ON mlink(fid);
CREATE INDEX repo.mlink_i4 ON mlink(pid);
CREATE TABLE repo.plink(
  pid INTEGER REFERENCES blob,
  cid INTEGER REFERENCES blob,
  isprim BOOLEAN,
  mtime DATETIME,
  baseid INTEGER REFERENCES blob,
  UNIQUE(pid, cid)
);
CREATE INDEX repo.plink_i2 ON plink(cid, pid);
CREATE TABLE repo.leaf(
  rid INTEGER PRIMARY KEY
);
CREATE TABLE repo.event(
  type TEXT,
  mtime DATETIME,
  objid INTEGER PRIMARY KEY,
  tagid INTEGER,
  uid INTEGER REFERENCES user,
  bgcolor TEXT,
  euser TEXT,
  user TEXT,
  ecomment TEXT,
  comment TEXT,
  brief TEXT,
  omtime DATETIME
);
CREATE INDEX repo.event_i1 ON event(mtime);
CREATE TABLE repo.phantom(
  rid INTEGER PRIMARY KEY
);
CREATE TABLE repo.orphan(
  rid INTEGER PRIMARY KEY,
  baseline INTEGER
);
CREATE INDEX repo.orphan_baseline ON orphan(baseline);
CREATE TABLE repo.unclustered(
  rid INTEGER PRIMARY KEY
);
CREATE TABLE repo.unsent(
  rid INTEGER PRIMARY KEY
);
CREATE TABLE repo.forumpost(
  fpid INTEGER PRIMARY KEY,
  froot INTEGER,
  fprev INTEGER,
  firt INTEGER,
  fmtime REAL
);
CREATE INDEX repo.forumpost_i1 ON forumpost(froot, fmtime);
CREATE TABLE repo.tag(
  tagid INTEGER PRIMARY KEY,
  tagname TEXT UNIQUE
);
CREATE TABLE repo.tagxref(
  tagid INTEGER REFERENCES tag,
  tagtype INTEGER,
  srcid INTEGER REFERENCES blob,
  origid INTEGER REFERENCES blob,
  value TEXT,
  mtime TIMESTAMP,
  rid INTEGER REFERENCES blob,
  UNIQUE(rid, tagid)
);
CREATE INDEX repo.tagxref_i1 ON tagxref(tagid, mtime);
"#;

/// Default ticket tables, used when the repository carries no
/// `ticket-table` config entry of its own.
pub const TICKET_SCHEMA: &str = r#"
CREATE TABLE repo.ticket(
  tkt_id INTEGER PRIMARY KEY,
  tkt_uuid TEXT UNIQUE,
  tkt_mtime DATE,
  tkt_ctime DATE,
  type TEXT,
  status TEXT,
  subsystem TEXT,
  priority TEXT,
  severity TEXT,
  foundin TEXT,
  private_contact TEXT,
  resolution TEXT,
  title TEXT,
  comment TEXT
);
CREATE TABLE repo.ticketchng(
  tkt_id INTEGER REFERENCES ticket,
  tkt_rid INTEGER REFERENCES blob,
  tkt_mtime DATE,
  login TEXT,
  username TEXT,
  mimetype TEXT,
  icomment TEXT
);
CREATE INDEX repo.ticketchng_idx1 ON ticketchng(tkt_id, tkt_mtime);
"#;

/// Checkout-state database.
pub const CKOUT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ckout.vvar(
  name TEXT PRIMARY KEY NOT NULL,
  value CLOB
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS ckout.vfile(
  id INTEGER PRIMARY KEY,
  vid INTEGER REFERENCES blob,
  chnged INT DEFAULT 0,
  deleted BOOLEAN DEFAULT 0,
  isexe BOOLEAN,
  islink BOOLEAN,
  rid INTEGER,
  mrid INTEGER,
  mtime INTEGER,
  pathname TEXT,
  origname TEXT,
  mhash TEXT,
  UNIQUE(pathname, vid)
);
CREATE TABLE IF NOT EXISTS ckout.vmerge(
  id INTEGER REFERENCES vfile,
  merge INTEGER,
  mhash TEXT,
  UNIQUE(id, merge)
);
"#;

/// Per-user global config database.
pub const CONFIG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cfg.global_config(
  name TEXT PRIMARY KEY,
  value TEXT
);
"#;
