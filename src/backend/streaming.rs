//! In-process streaming driver built on [`HttpClient`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, instrument, warn};

use super::{
    BackendDriver, BackendKind, TransferHandle, TransferRequest, TransferState, TransferStatus,
};
use crate::download::{
    DownloadError, HttpClient, NameHints, ProbeInfo, TransferError, TransferProgress,
    VerificationError, VerifiedArtifact, classify_error, derive_filename, part_file_name, promote,
};

/// A finished stream waiting for verification.
#[derive(Debug, Clone)]
struct Finished {
    part_path: PathBuf,
    filename: String,
    content_length: Option<u64>,
}

#[derive(Debug)]
struct Transfer {
    request: TransferRequest,
    cancel: CancellationToken,
    progress: Arc<TransferProgress>,
    outcome: Mutex<Option<Result<Finished, TransferError>>>,
}

impl Transfer {
    fn outcome(&self) -> Option<Result<Finished, TransferError>> {
        self.outcome
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn finish(&self, result: Result<Finished, TransferError>) {
        *self
            .outcome
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(result);
    }
}

/// Single-connection HTTP driver. Each transfer runs on its own task.
#[derive(Debug)]
pub struct StreamingDriver {
    client: HttpClient,
    transfers: Mutex<HashMap<String, Arc<Transfer>>>,
    next_id: AtomicU64,
}

impl StreamingDriver {
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            transfers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lookup(&self, handle: &TransferHandle) -> Option<Arc<Transfer>> {
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&handle.id)
            .cloned()
    }

    fn forget(&self, handle: &TransferHandle) -> Option<Arc<Transfer>> {
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&handle.id)
    }
}

async fn run_transfer(
    client: HttpClient,
    transfer: Arc<Transfer>,
) -> Result<Finished, DownloadError> {
    let request = &transfer.request;
    let probe = client.probe(&request.url).await?;
    let url = probe.final_url.clone().unwrap_or_else(|| request.url.clone());

    let provisional = derive_filename(&NameHints {
        title: request.title.as_deref(),
        url: Some(&url),
        content_type: probe.content_type.as_deref(),
        content_disposition: probe.content_disposition.as_deref(),
    });
    let part_path = request
        .incomplete_dir
        .join(part_file_name(request.item.as_str()));

    let streamed = client
        .stream_to_part(
            &request.url,
            &part_path,
            &probe,
            &transfer.progress,
            &transfer.cancel,
        )
        .await?;

    let filename = final_filename(request, &url, &probe, streamed.content_type.as_deref())
        .unwrap_or(provisional);
    Ok(Finished {
        part_path: streamed.part_path,
        filename,
        content_length: streamed.content_length,
    })
}

/// Re-derives the name when the GET told us a content type the HEAD did not.
fn final_filename(
    request: &TransferRequest,
    url: &url::Url,
    probe: &ProbeInfo,
    content_type: Option<&str>,
) -> Option<String> {
    if probe.content_type.is_some() {
        return None;
    }
    let content_type = content_type?;
    Some(derive_filename(&NameHints {
        title: request.title.as_deref(),
        url: Some(url),
        content_type: Some(content_type),
        content_disposition: probe.content_disposition.as_deref(),
    }))
}

#[async_trait]
impl BackendDriver for StreamingDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    async fn is_available(&self) -> bool {
        true
    }

    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        let id = format!("stream-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = TransferHandle {
            id: id.clone(),
            backend: BackendKind::Streaming,
            url: request.url.to_string(),
        };
        let transfer = Arc::new(Transfer {
            request,
            cancel: CancellationToken::new(),
            progress: Arc::new(TransferProgress::default()),
            outcome: Mutex::new(None),
        });
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&transfer));

        let client = self.client.clone();
        let span = info_span!("stream_transfer", id = %id);
        tokio::spawn(
            async move {
                let result = run_transfer(client, Arc::clone(&transfer)).await;
                if let Err(error) = &result {
                    warn!(error = %error, "streaming transfer failed");
                }
                transfer.finish(result.map_err(|e| classify_error(&e)));
            }
            .instrument(span),
        );

        debug!(id = %handle.id, "streaming transfer started");
        Ok(handle)
    }

    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, TransferError> {
        let transfer = self
            .lookup(handle)
            .ok_or_else(|| TransferError::permanent(format!("unknown transfer {}", handle.id)))?;
        let state = match transfer.outcome() {
            None => TransferState::Active,
            Some(Ok(_)) => TransferState::Completed,
            Some(Err(error)) => {
                self.forget(handle);
                TransferState::Failed(error)
            }
        };
        Ok(TransferStatus {
            bytes_transferred: transfer.progress.bytes(),
            total_bytes: transfer.progress.total(),
            state,
        })
    }

    async fn cancel(&self, handle: &TransferHandle) -> Result<(), TransferError> {
        if let Some(transfer) = self.forget(handle) {
            transfer.cancel.cancel();
            debug!(id = %handle.id, "streaming transfer cancelled");
        }
        Ok(())
    }

    async fn verify(&self, handle: &TransferHandle) -> Result<VerifiedArtifact, VerificationError> {
        let transfer = self
            .lookup(handle)
            .ok_or_else(|| VerificationError::invalid(format!("unknown transfer {}", handle.id)))?;
        let finished = match transfer.outcome() {
            Some(Ok(finished)) => finished,
            Some(Err(error)) => {
                return Err(VerificationError::invalid(format!("transfer failed: {error}")));
            }
            None => return Err(VerificationError::invalid("transfer still running")),
        };
        let result = promote(
            &finished.part_path,
            &transfer.request.output_dir,
            &finished.filename,
            finished.content_length,
        )
        .await;
        self.forget(handle);
        result
    }
}
