//! Small shared utilities: blob framing, pathname rules, time conversion,
//! glob lists.

pub mod compression;
pub mod glob;
pub mod path;
pub mod time;
