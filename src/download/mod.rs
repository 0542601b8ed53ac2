//! Transfer plumbing shared by the backend drivers.
//!
//! This module provides the streaming HTTP client, artifact naming and
//! verification, and the retry/failover policy.
//!
//! # Features
//!
//! - Streaming downloads into `.part` files (memory-efficient for large files)
//! - Range resume when the mirror advertises `Accept-Ranges: bytes`
//! - HTML error-page detection before and after the transfer
//! - Duplicate filename handling (adds numeric suffix)
//! - Pure failover decisions with bounded exponential backoff

mod client;
pub mod constants;
mod error;
pub mod filename;
mod retry;
mod verify;

pub use client::{HttpClient, ProbeInfo, StreamOutcome, TransferProgress};
pub use error::{DownloadError, TransferError};
pub use filename::{NameHints, derive_filename, part_file_name, strip_archive_suffix};
pub use retry::{
    AttemptFailure, Backoff, DEFAULT_MAX_RETRIES, FailoverContext, FailoverDecision,
    FailoverPolicy, classify_error, classify_fetch_error, classify_http_status,
    is_transient_status, parse_retry_after,
};
pub use verify::{ContentSniff, VerificationError, VerifiedArtifact, inspect_file, promote, sniff};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
