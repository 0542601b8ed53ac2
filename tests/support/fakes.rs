//! In-process stand-ins for the page fetcher, backend driver, and sleeper.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stacks_core::clock::Sleeper;
use stacks_core::download::{TransferError, VerificationError, VerifiedArtifact};
use stacks_core::resolver::{FetchError, FetchedPage, PageFetcher};
use stacks_core::{
    BackendDriver, BackendKind, TransferHandle, TransferRequest, TransferState, TransferStatus,
};
use url::Url;

pub const ARTIFACT_SIZE: u64 = 1024;

// ==================== Pages ====================

/// Source page HTML with one anchor per mirror link.
#[must_use]
pub fn source_page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!("<li><a href=\"{href}\">mirror</a></li>"))
        .collect();
    format!("<html><body><div class=\"text-3xl font-bold\">{title}</div><ul>{anchors}</ul></body></html>")
}

/// Serves fixed pages by URL; anything else is a 404.
#[derive(Default)]
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, (u16, String)>>,
    stalled: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page(self, url: &str, status: u16, body: impl Into<String>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.into()));
        self
    }

    /// Requests for `url` never answer.
    #[must_use]
    pub fn with_stall(self, url: &str) -> Self {
        self.stalled.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|fetched| fetched.as_str() == url)
            .count()
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(url.to_string());
        let stalled = self.stalled.lock().unwrap().contains(url.as_str());
        if stalled {
            std::future::pending::<()>().await;
        }
        let (status, body) = self
            .pages
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .unwrap_or((404, "not found".to_string()));
        Ok(FetchedPage {
            url: url.clone(),
            status,
            content_type: Some("text/html; charset=utf-8".to_string()),
            retry_after: None,
            body,
        })
    }
}

// ==================== Backend ====================

/// What one started transfer does.
#[derive(Debug, Clone)]
pub enum Step {
    Complete,
    Fail(TransferError),
    Reject(VerificationError),
    /// Stays active until cancelled.
    Hang,
    /// Finishes, then never returns from verification.
    HangInVerify,
}

/// Driver whose transfers follow a per-URL script. Unscripted URLs complete.
pub struct ScriptedDriver {
    kind: BackendKind,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    transfers: Mutex<HashMap<String, (String, Step)>>,
    starts: Mutex<Vec<String>>,
    polls: AtomicUsize,
    cancels: AtomicUsize,
}

impl ScriptedDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: BackendKind::Streaming,
            scripts: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn script(self, url: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into());
        self
    }

    /// URLs passed to `start`, in order.
    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn step_for(&self, handle: &TransferHandle) -> Step {
        self.transfers
            .lock()
            .unwrap()
            .get(&handle.id)
            .map_or(Step::Complete, |(_, step)| step.clone())
    }
}

#[async_trait]
impl BackendDriver for ScriptedDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        let url = request.url.to_string();
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&url)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Complete);
        let id = {
            let mut starts = self.starts.lock().unwrap();
            starts.push(url.clone());
            format!("t{}", starts.len())
        };
        self.transfers
            .lock()
            .unwrap()
            .insert(id.clone(), (url.clone(), step));
        Ok(TransferHandle {
            id,
            backend: self.kind,
            url,
        })
    }

    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, TransferError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let status = match self.step_for(handle) {
            Step::Complete | Step::Reject(_) | Step::HangInVerify => TransferStatus {
                bytes_transferred: ARTIFACT_SIZE,
                total_bytes: Some(ARTIFACT_SIZE),
                state: TransferState::Completed,
            },
            Step::Fail(error) => TransferStatus {
                bytes_transferred: 0,
                total_bytes: None,
                state: TransferState::Failed(error),
            },
            Step::Hang => TransferStatus {
                bytes_transferred: ARTIFACT_SIZE / 4,
                total_bytes: Some(ARTIFACT_SIZE),
                state: TransferState::Active,
            },
        };
        Ok(status)
    }

    async fn cancel(&self, _handle: &TransferHandle) -> Result<(), TransferError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn verify(&self, handle: &TransferHandle) -> Result<VerifiedArtifact, VerificationError> {
        match self.step_for(handle) {
            Step::Reject(error) => Err(error),
            Step::HangInVerify => std::future::pending().await,
            _ => Ok(VerifiedArtifact {
                path: PathBuf::from(format!("/library/{}.epub", handle.id)),
                size: ARTIFACT_SIZE,
            }),
        }
    }
}

// ==================== Time ====================

/// Records requested delays and only yields.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}
