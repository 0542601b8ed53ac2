//! Backend drivers: the components that actually move bytes.
//!
//! Both drivers implement [`BackendDriver`]. The queue picks one per job via
//! [`BackendSet::choose`], falling back to streaming when the external
//! download manager does not answer.

mod external;
mod streaming;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::download::{TransferError, VerificationError, VerifiedArtifact};
use crate::queue::ItemId;

pub use external::ExternalDriver;
pub use streaming::StreamingDriver;

/// Which driver performs a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process single-connection HTTP.
    #[default]
    Streaming,
    /// Out-of-process multi-connection download manager.
    External,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::External => "external",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "http" => Ok(Self::Streaming),
            "external" | "aria2" => Ok(Self::External),
            other => Err(format!(
                "unknown backend '{other}' (expected 'streaming' or 'external')"
            )),
        }
    }
}

/// Everything a driver needs to start one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// The item being fetched; keys the in-flight file.
    pub item: ItemId,
    /// Direct link to the file.
    pub url: Url,
    /// Item title, used to name the artifact.
    pub title: Option<String>,
    /// Where in-flight files live.
    pub incomplete_dir: PathBuf,
    /// Where verified artifacts land.
    pub output_dir: PathBuf,
}

/// Opaque reference to a started transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    pub id: String,
    pub backend: BackendKind,
    pub url: String,
}

/// Coarse transfer state reported by [`BackendDriver::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Completed,
    Failed(TransferError),
}

/// A poll result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub state: TransferState,
}

/// Contract shared by the streaming and external drivers.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the driver can take work right now.
    async fn is_available(&self) -> bool;

    /// Starts a transfer and returns immediately.
    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError>;

    /// Reports progress and state.
    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, TransferError>;

    /// Best-effort stop. Leaves the partial file resumable when possible.
    async fn cancel(&self, handle: &TransferHandle) -> Result<(), TransferError>;

    /// Checks the finished artifact and moves it into the output directory.
    async fn verify(&self, handle: &TransferHandle) -> Result<VerifiedArtifact, VerificationError>;
}

/// The drivers available to the queue.
#[derive(Clone)]
pub struct BackendSet {
    pub streaming: Arc<dyn BackendDriver>,
    pub external: Option<Arc<dyn BackendDriver>>,
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSet")
            .field("external", &self.external.is_some())
            .finish_non_exhaustive()
    }
}

impl BackendSet {
    #[must_use]
    pub fn streaming_only(streaming: Arc<dyn BackendDriver>) -> Self {
        Self {
            streaming,
            external: None,
        }
    }

    /// Driver for `kind`; streaming when no external driver is configured.
    #[must_use]
    pub fn get(&self, kind: BackendKind) -> Arc<dyn BackendDriver> {
        match (kind, &self.external) {
            (BackendKind::External, Some(external)) => Arc::clone(external),
            _ => Arc::clone(&self.streaming),
        }
    }

    /// Picks the driver for a new job.
    ///
    /// Returns the driver plus a note when the preference could not be honored.
    pub async fn choose(&self, preferred: BackendKind) -> (Arc<dyn BackendDriver>, Option<String>) {
        if preferred == BackendKind::Streaming {
            return (Arc::clone(&self.streaming), None);
        }
        match &self.external {
            Some(external) if external.is_available().await => {
                info!("using external backend");
                (Arc::clone(external), None)
            }
            Some(_) => {
                warn!("external backend unreachable, falling back to streaming");
                (
                    Arc::clone(&self.streaming),
                    Some("external backend unreachable; using streaming".to_string()),
                )
            }
            None => (
                Arc::clone(&self.streaming),
                Some("external backend not configured; using streaming".to_string()),
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct StubDriver {
        kind: BackendKind,
        available: bool,
    }

    #[async_trait]
    impl BackendDriver for StubDriver {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn start(&self, _request: TransferRequest) -> Result<TransferHandle, TransferError> {
            Err(TransferError::backend_unavailable("stub"))
        }

        async fn poll(&self, _handle: &TransferHandle) -> Result<TransferStatus, TransferError> {
            Err(TransferError::backend_unavailable("stub"))
        }

        async fn cancel(&self, _handle: &TransferHandle) -> Result<(), TransferError> {
            Ok(())
        }

        async fn verify(
            &self,
            _handle: &TransferHandle,
        ) -> Result<VerifiedArtifact, VerificationError> {
            Err(VerificationError::invalid("stub"))
        }
    }

    fn set(external_available: Option<bool>) -> BackendSet {
        BackendSet {
            streaming: Arc::new(StubDriver {
                kind: BackendKind::Streaming,
                available: true,
            }),
            external: external_available.map(|available| {
                Arc::new(StubDriver {
                    kind: BackendKind::External,
                    available,
                }) as Arc<dyn BackendDriver>
            }),
        }
    }

    #[test]
    fn test_backend_kind_parse_and_display() {
        assert_eq!("aria2".parse::<BackendKind>().unwrap(), BackendKind::External);
        assert_eq!(" Streaming ".parse::<BackendKind>().unwrap(), BackendKind::Streaming);
        assert!("ftp".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::External.to_string(), "external");
    }

    #[test]
    fn test_backend_kind_serde_lowercase() {
        let json = serde_json::to_string(&BackendKind::External).unwrap();
        assert_eq!(json, "\"external\"");
    }

    #[tokio::test]
    async fn test_choose_external_when_available() {
        let (driver, note) = set(Some(true)).choose(BackendKind::External).await;
        assert_eq!(driver.kind(), BackendKind::External);
        assert!(note.is_none());
    }

    #[tokio::test]
    async fn test_choose_falls_back_when_external_unreachable() {
        let (driver, note) = set(Some(false)).choose(BackendKind::External).await;
        assert_eq!(driver.kind(), BackendKind::Streaming);
        assert!(note.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_choose_streaming_never_probes_external() {
        let (driver, note) = set(None).choose(BackendKind::Streaming).await;
        assert_eq!(driver.kind(), BackendKind::Streaming);
        assert!(note.is_none());
    }

    #[test]
    fn test_get_without_external_is_streaming() {
        assert_eq!(set(None).get(BackendKind::External).kind(), BackendKind::Streaming);
    }
}
