//! Stacks Core Library
//!
//! Resolves catalog items to download mirrors, queues them, and drives each
//! transfer through a pluggable backend with per-mirror retry and failover.
//!
//! # Architecture
//!
//! - [`resolver`] - scrapes an item page into an ordered mirror list
//! - [`fastlane`] - quota-limited priority links from the authenticated API
//! - [`backend`] - streaming and external transfer drivers
//! - [`download`] - HTTP transfer, retry policy, and artifact verification
//! - [`queue`] - the single-worker job state machine with persistence
//! - [`status`] - snapshots for presentation layers
//! - [`config`] - TOML configuration with validation
//! - [`failure`] - user-facing error taxonomy

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod clock;
pub mod config;
pub mod download;
pub mod failure;
pub mod fastlane;
pub mod logging;
pub mod queue;
pub mod resolver;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use backend::{
    BackendDriver, BackendKind, BackendSet, ExternalDriver, StreamingDriver, TransferHandle,
    TransferRequest, TransferState, TransferStatus,
};
pub use clock::{Sleeper, TokioSleeper};
pub use config::{ConfigError, EngineConfig, resolve_default_config_path};
pub use download::{
    Backoff, DownloadError, FailoverDecision, FailoverPolicy, HttpClient, TransferError,
    VerificationError,
};
pub use failure::{ErrorKind, JobError};
pub use fastlane::{FastLaneClient, QuotaError, QuotaSnapshot, QuotaState};
pub use queue::{
    DownloadJob, HistoryRecord, ItemId, JobState, JobSummary, JsonFileStore, QueueError,
    QueueManager, RunStats,
};
pub use resolver::{Mirror, MirrorOrigin, MirrorResolver, ResolutionError, ResolvedItem};
pub use status::{StatusPublisher, StatusSnapshot};
