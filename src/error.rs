//! Error types for the engine.
//!
//! Every failure carries a stable [`ErrorKind`] plus a formatted message.
//! Callers are expected to switch on the kind, never on message text. The
//! kind set is closed: downstream code can exhaustively match it.

use std::fmt;

// ============================================================================
// Error Kinds
// ============================================================================

/// Stable identity of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// Catch-all for errors with no more specific kind.
  Error,
  /// Not yet implemented.
  Nyi,
  /// Allocation failure. Carries no formatted message.
  Oom,
  /// API misuse (e.g. re-acquiring a loaned statement).
  Misuse,
  /// A value is out of its legal range.
  Range,
  /// Permission / access problem.
  Access,
  /// Filesystem or stream I/O failure.
  Io,
  /// The requested resource does not exist.
  NotFound,
  /// An insert/create collided with existing state.
  AlreadyExists,
  /// Data-level corruption (bad Z-card, delta cycle, hash mismatch source).
  Consistency,
  /// The attached database is not a repository.
  NotARepo,
  /// The directory is not (in) a checkout.
  NotACkout,
  /// Repository schema version is newer than this library supports.
  RepoVersion,
  /// Repository schema version requires a rebuild before use.
  RepoNeedsRebuild,
  /// Checkout belongs to a different repository than the one opened.
  RepoMismatch,
  /// SQLite-level failure; message carries the driver text.
  Db,
  /// A statement step produced a row.
  StepRow,
  /// A statement step completed with no row.
  StepDone,
  /// A statement step failed.
  StepError,
  /// Cooperative "stop iterating without failing".
  Break,
  /// A card or operation is illegal for the artifact type.
  Type,
  /// Artifact text failed to parse.
  Syntax,
  /// A symbol/prefix matched more than one artifact.
  Ambiguous,
  /// A name the repository has no record of (vs. a missing file on disk).
  UnknownResource,
  /// The blob is a phantom: hash known, content not yet available.
  Phantom,
  /// An operation lacks required context (e.g. no user name set).
  MissingInfo,
  /// The operation had nothing to do.
  Noop,
  /// Delta stream: a required separator byte was wrong.
  DeltaInvalidSeparator,
  /// Delta stream: a size field did not parse.
  DeltaInvalidSize,
  /// Delta stream: unknown operator letter.
  DeltaInvalidOperator,
  /// Delta stream: missing or malformed terminator.
  DeltaInvalidTerminator,
  /// A recomputed digest disagreed with the recorded one.
  ChecksumMismatch,
  /// A decoded length disagreed with the recorded one.
  SizeMismatch,
  /// A merge produced conflicts.
  Conflict,
}

impl ErrorKind {
  /// Short stable label, used in Display output.
  pub fn label(self) -> &'static str {
    match self {
      ErrorKind::Error => "error",
      ErrorKind::Nyi => "nyi",
      ErrorKind::Oom => "oom",
      ErrorKind::Misuse => "misuse",
      ErrorKind::Range => "range",
      ErrorKind::Access => "access",
      ErrorKind::Io => "io",
      ErrorKind::NotFound => "not-found",
      ErrorKind::AlreadyExists => "already-exists",
      ErrorKind::Consistency => "consistency",
      ErrorKind::NotARepo => "not-a-repo",
      ErrorKind::NotACkout => "not-a-checkout",
      ErrorKind::RepoVersion => "repo-version",
      ErrorKind::RepoNeedsRebuild => "repo-needs-rebuild",
      ErrorKind::RepoMismatch => "repo-mismatch",
      ErrorKind::Db => "db",
      ErrorKind::StepRow => "step-row",
      ErrorKind::StepDone => "step-done",
      ErrorKind::StepError => "step-error",
      ErrorKind::Break => "break",
      ErrorKind::Type => "type",
      ErrorKind::Syntax => "syntax",
      ErrorKind::Ambiguous => "ambiguous",
      ErrorKind::UnknownResource => "unknown-resource",
      ErrorKind::Phantom => "phantom",
      ErrorKind::MissingInfo => "missing-info",
      ErrorKind::Noop => "noop",
      ErrorKind::DeltaInvalidSeparator => "delta-invalid-separator",
      ErrorKind::DeltaInvalidSize => "delta-invalid-size",
      ErrorKind::DeltaInvalidOperator => "delta-invalid-operator",
      ErrorKind::DeltaInvalidTerminator => "delta-invalid-terminator",
      ErrorKind::ChecksumMismatch => "checksum-mismatch",
      ErrorKind::SizeMismatch => "size-mismatch",
      ErrorKind::Conflict => "conflict",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

// ============================================================================
// Error
// ============================================================================

/// An engine error: a stable kind plus a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SiltError {
  kind: ErrorKind,
  message: String,
}

impl SiltError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  /// Allocation failure. Never formats a message.
  pub fn oom() -> Self {
    Self {
      kind: ErrorKind::Oom,
      message: String::new(),
    }
  }

  pub fn misuse(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Misuse, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NotFound, message)
  }

  pub fn consistency(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Consistency, message)
  }

  pub fn range(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Range, message)
  }

  pub fn syntax(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Syntax, message)
  }

  pub fn type_error(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Type, message)
  }

  /// The cooperative stop-without-error signal: a dedicated code rather than
  /// an overloaded boolean.
  pub fn stop() -> Self {
    Self::new(ErrorKind::Break, "iteration stopped")
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  /// True for the cooperative break signal.
  pub fn is_break(&self) -> bool {
    self.kind == ErrorKind::Break
  }
}

impl From<rusqlite::Error> for SiltError {
  fn from(e: rusqlite::Error) -> Self {
    match e {
      rusqlite::Error::QueryReturnedNoRows => {
        SiltError::new(ErrorKind::StepDone, "query returned no rows")
      }
      other => SiltError::new(ErrorKind::Db, other.to_string()),
    }
  }
}

impl From<std::io::Error> for SiltError {
  fn from(e: std::io::Error) -> Self {
    let kind = match e.kind() {
      std::io::ErrorKind::NotFound => ErrorKind::NotFound,
      std::io::ErrorKind::PermissionDenied => ErrorKind::Access,
      _ => ErrorKind::Io,
    };
    SiltError::new(kind, e.to_string())
  }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SiltError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kind_is_stable() {
    let e = SiltError::new(ErrorKind::Ambiguous, "prefix abcd matches 2 blobs");
    assert_eq!(e.kind(), ErrorKind::Ambiguous);
    assert!(e.to_string().contains("ambiguous"));
  }

  #[test]
  fn test_break_is_not_an_error_flavor() {
    assert!(SiltError::stop().is_break());
    assert!(!SiltError::misuse("x").is_break());
  }

  #[test]
  fn test_no_rows_maps_to_step_done() {
    let e: SiltError = rusqlite::Error::QueryReturnedNoRows.into();
    assert_eq!(e.kind(), ErrorKind::StepDone);
  }
}
