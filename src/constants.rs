//! Engine-wide constants.

/// Exact value the `content-schema` config entry must carry.
pub const CONTENT_SCHEMA: &str = "2";

/// Exact value the `aux-schema` config entry must carry.
pub const AUX_SCHEMA: &str = "2015-01-24";

/// Hex length of a SHA-1 hash.
pub const STRLEN_SHA1: usize = 40;

/// Hex length of a SHA-3-256 hash.
pub const STRLEN_SHA3: usize = 64;

/// Hex length of an MD5 digest (Z/R cards only, never a blob name).
pub const STRLEN_MD5: usize = 32;

/// Shortest hash prefix the resolver accepts.
pub const UUID_PREFIX_MIN: usize = 4;

/// Ceiling on uncompressed blob content: 2^31 - 2^28 bytes.
pub const BLOB_SIZE_LIMIT: i64 = (1i64 << 31) - (1i64 << 28);

/// Minimum content size (both sides) before deltification is attempted.
pub const DELTA_MIN_CONTENT: i64 = 50;

/// A delta is kept only when its length is <= content * 3/4.
pub const DELTA_MAX_RATIO_NUM: u64 = 3;
pub const DELTA_MAX_RATIO_DEN: u64 = 4;

/// Checkout-state database names, per platform convention.
pub const CKOUT_DB_NAME_UNIX: &str = ".fslckout";
pub const CKOUT_DB_NAME_WINDOWS: &str = "_FOSSIL_";

/// Role schema names used in fully-qualified SQL.
pub const DB_ROLE_REPO: &str = "repo";
pub const DB_ROLE_CKOUT: &str = "ckout";
pub const DB_ROLE_CONFIG: &str = "cfg";

/// Upper bound of the legal Julian Day range for D/E cards.
pub const JULIAN_DAY_MAX: f64 = 5373484.5;

/// Delta-chain walks refuse to follow more than this many links.
pub const DELTA_CHAIN_LIMIT: usize = 10_000;

/// Reconstructed chain content is cached every this many links.
pub const DELTA_CHAIN_CACHE_STEP: usize = 8;

/// Bounds of the in-memory reconstructed-content cache.
pub const CONTENT_CACHE_MAX_ENTRIES: usize = 32;
pub const CONTENT_CACHE_MAX_BYTES: usize = 8 * 1024 * 1024;

/// MD5 of the empty string: the only legal R-card for a checkin with no
/// F-cards.
pub const MD5_EMPTY_HEX: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Default branch name for new repositories.
pub const DEFAULT_MAIN_BRANCH: &str = "trunk";

/// Files regenerated at the checkout root after checkout/update, gated by
/// the `manifest` config setting.
pub const MANIFEST_FILE: &str = "manifest";
pub const MANIFEST_UUID_FILE: &str = "manifest.uuid";
pub const MANIFEST_TAGS_FILE: &str = "manifest.tags";
