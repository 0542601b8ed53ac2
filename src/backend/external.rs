//! External driver: delegates transfers to an aria2-compatible JSON-RPC daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    BackendDriver, BackendKind, TransferHandle, TransferRequest, TransferState, TransferStatus,
};
use crate::config::ExternalSettings;
use crate::download::{
    HttpClient, NameHints, TransferError, VerificationError, VerifiedArtifact, classify_error,
    derive_filename, inspect_file, part_file_name, promote,
};

/// RPC requests are small; anything slower means the daemon is in trouble.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// aria2 error codes that will not change on retry.
const PERMANENT_ERROR_CODES: &[&str] = &["3", "22", "24"];

const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "errorCode",
    "errorMessage",
    "files",
];

#[derive(Debug, Deserialize)]
struct RpcReply<T> {
    result: Option<T>,
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Aria2Status {
    status: String,
    #[serde(default)]
    total_length: Option<String>,
    #[serde(default)]
    completed_length: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<Aria2File>,
}

#[derive(Debug, Clone, Deserialize)]
struct Aria2File {
    #[serde(default)]
    path: String,
}

impl Aria2Status {
    fn total(&self) -> Option<u64> {
        parse_length(self.total_length.as_deref()).filter(|total| *total > 0)
    }

    fn completed(&self) -> u64 {
        parse_length(self.completed_length.as_deref()).unwrap_or(0)
    }

    fn state(&self) -> TransferState {
        match self.status.as_str() {
            "active" | "waiting" | "paused" => TransferState::Active,
            "complete" => TransferState::Completed,
            "removed" => TransferState::Failed(TransferError::permanent(
                "download was removed from the external backend",
            )),
            "error" => {
                let code = self.error_code.as_deref().unwrap_or("1");
                let message = format!(
                    "external backend error {code}: {}",
                    self.error_message.as_deref().unwrap_or("unknown error")
                );
                if PERMANENT_ERROR_CODES.contains(&code) {
                    TransferState::Failed(TransferError::permanent(message))
                } else {
                    TransferState::Failed(TransferError::transient(message))
                }
            }
            other => TransferState::Failed(TransferError::transient(format!(
                "unknown external backend status '{other}'"
            ))),
        }
    }

    fn output_path(&self) -> Option<PathBuf> {
        self.files
            .first()
            .map(|file| file.path.as_str())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}

fn parse_length(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

#[derive(Debug)]
enum RpcError {
    /// The daemon could not be reached or answered garbage.
    Transport(String),
    /// The daemon answered with a JSON-RPC error.
    Fault { code: i64, message: String },
}

impl RpcError {
    fn into_transfer_error(self) -> TransferError {
        match self {
            Self::Transport(message) => TransferError::backend_unavailable(message),
            Self::Fault { code, message } => {
                TransferError::transient(format!("external backend rejected request ({code}): {message}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    request: TransferRequest,
    /// Final artifact name.
    filename: String,
    /// Name of the in-flight file inside the incomplete directory.
    out: String,
}

/// aria2 JSON-RPC driver.
#[derive(Debug)]
pub struct ExternalDriver {
    client: Client,
    http: HttpClient,
    endpoint: Url,
    secret: Option<String>,
    next_id: AtomicU64,
    transfers: Mutex<HashMap<String, Tracked>>,
}

impl ExternalDriver {
    /// Creates a driver for the daemon described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferError::BackendUnavailable`] when the endpoint is
    /// malformed or the HTTP client cannot be built.
    pub fn new(settings: &ExternalSettings) -> Result<Self, TransferError> {
        let endpoint = Url::parse(&settings.endpoint()).map_err(|e| {
            TransferError::backend_unavailable(format!("invalid external endpoint: {e}"))
        })?;
        let client = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| TransferError::backend_unavailable(e.to_string()))?;
        let http = HttpClient::new().map_err(|e| TransferError::backend_unavailable(e.to_string()))?;
        Ok(Self {
            client,
            http,
            endpoint,
            secret: settings.secret.clone().filter(|s| !s.is_empty()),
            next_id: AtomicU64::new(1),
            transfers: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, RpcError> {
        let mut full_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            full_params.push(Value::String(format!("token:{secret}")));
        }
        full_params.extend(params);

        let id = format!("stacks-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": full_params,
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("{method}: {e}")))?;

        let reply: RpcReply<T> = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(format!("{method}: undecodable reply: {e}")))?;

        if let Some(fault) = reply.error {
            return Err(RpcError::Fault {
                code: fault.code,
                message: fault.message,
            });
        }
        reply
            .result
            .ok_or_else(|| RpcError::Transport(format!("{method}: reply carried no result")))
    }

    async fn tell_status(&self, gid: &str) -> Result<Aria2Status, RpcError> {
        self.call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await
    }

    fn tracked(&self, gid: &str) -> Option<Tracked> {
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(gid)
            .cloned()
    }

    fn forget(&self, gid: &str) {
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(gid);
    }

    /// Drops earlier transfers of the same item, returning their gids.
    fn supersede(&self, request: &TransferRequest) -> Vec<String> {
        let mut transfers = self
            .transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stale: Vec<String> = transfers
            .iter()
            .filter(|(_, tracked)| tracked.request.item == request.item)
            .map(|(gid, _)| gid.clone())
            .collect();
        for gid in &stale {
            transfers.remove(gid);
        }
        stale
    }
}

#[async_trait]
impl BackendDriver for ExternalDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn is_available(&self) -> bool {
        match self.call::<Value>("aria2.getVersion", Vec::new()).await {
            Ok(version) => {
                debug!(version = %version["version"], "external backend reachable");
                true
            }
            Err(error) => {
                warn!(?error, "external backend unreachable");
                false
            }
        }
    }

    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn start(&self, request: TransferRequest) -> Result<TransferHandle, TransferError> {
        let probe = self
            .http
            .probe(&request.url)
            .await
            .map_err(|e| classify_error(&e))?;
        let url = probe.final_url.clone().unwrap_or_else(|| request.url.clone());
        let filename = derive_filename(&NameHints {
            title: request.title.as_deref(),
            url: Some(&url),
            content_type: probe.content_type.as_deref(),
            content_disposition: probe.content_disposition.as_deref(),
        });
        let out = part_file_name(request.item.as_str());
        tokio::fs::create_dir_all(&request.incomplete_dir)
            .await
            .map_err(|e| TransferError::permanent(format!("cannot create incomplete dir: {e}")))?;

        for stale in self.supersede(&request) {
            debug!(gid = %stale, "dropping superseded external transfer");
            let _ = self
                .call::<Value>("aria2.removeDownloadResult", vec![json!(stale)])
                .await;
        }

        let options = json!({
            "dir": request.incomplete_dir.to_string_lossy(),
            "out": out,
            "continue": "true",
            "auto-file-renaming": "false",
        });
        let gid: String = self
            .call(
                "aria2.addUri",
                vec![json!([request.url.as_str()]), options],
            )
            .await
            .map_err(RpcError::into_transfer_error)?;

        debug!(gid = %gid, filename = %filename, "external transfer started");
        let handle = TransferHandle {
            id: gid.clone(),
            backend: BackendKind::External,
            url: request.url.to_string(),
        };
        self.transfers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                gid,
                Tracked {
                    request,
                    filename,
                    out,
                },
            );
        Ok(handle)
    }

    async fn poll(&self, handle: &TransferHandle) -> Result<TransferStatus, TransferError> {
        let status = self.tell_status(&handle.id).await.map_err(|error| match error {
            RpcError::Fault { message, .. } => {
                TransferError::permanent(format!("external transfer {} lost: {message}", handle.id))
            }
            transport @ RpcError::Transport(_) => transport.into_transfer_error(),
        })?;
        Ok(TransferStatus {
            bytes_transferred: status.completed(),
            total_bytes: status.total(),
            state: status.state(),
        })
    }

    async fn cancel(&self, handle: &TransferHandle) -> Result<(), TransferError> {
        let removed = self
            .call::<Value>("aria2.forceRemove", vec![json!(handle.id)])
            .await;
        let _ = self
            .call::<Value>("aria2.removeDownloadResult", vec![json!(handle.id)])
            .await;
        self.forget(&handle.id);
        match removed {
            Ok(_) | Err(RpcError::Fault { .. }) => Ok(()),
            Err(transport) => Err(transport.into_transfer_error()),
        }
    }

    async fn verify(&self, handle: &TransferHandle) -> Result<VerifiedArtifact, VerificationError> {
        let tracked = self.tracked(&handle.id).ok_or_else(|| {
            VerificationError::invalid(format!("unknown transfer {}", handle.id))
        })?;
        let status = self.tell_status(&handle.id).await.ok();
        let path = status
            .as_ref()
            .and_then(Aria2Status::output_path)
            .unwrap_or_else(|| tracked.request.incomplete_dir.join(&tracked.out));
        let expected = status.as_ref().and_then(Aria2Status::total);

        // A short file stays resumable: keep the result and its control file.
        if let Err(error @ VerificationError::SizeMismatch { .. }) =
            inspect_file(&path, expected).await
        {
            return Err(error);
        }

        let _ = self
            .call::<Value>("aria2.removeDownloadResult", vec![json!(handle.id)])
            .await;
        let control_file = PathBuf::from(format!("{}.aria2", path.display()));
        let _ = tokio::fs::remove_file(&control_file).await;

        let result = promote(&path, &tracked.request.output_dir, &tracked.filename, expected).await;
        if !matches!(result, Err(VerificationError::SizeMismatch { .. })) {
            self.forget(&handle.id);
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn status(raw: &str) -> Aria2Status {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_status_mapping_active_states() {
        for name in ["active", "waiting", "paused"] {
            let parsed = status(&format!(r#"{{"status":"{name}"}}"#));
            assert_eq!(parsed.state(), TransferState::Active);
        }
        assert_eq!(
            status(r#"{"status":"complete"}"#).state(),
            TransferState::Completed
        );
    }

    #[test]
    fn test_status_mapping_error_codes() {
        let not_found = status(r#"{"status":"error","errorCode":"3","errorMessage":"404"}"#);
        assert!(matches!(
            not_found.state(),
            TransferState::Failed(TransferError::Permanent { .. })
        ));
        let network = status(r#"{"status":"error","errorCode":"6"}"#);
        assert!(matches!(
            network.state(),
            TransferState::Failed(TransferError::Transient { .. })
        ));
        let removed = status(r#"{"status":"removed"}"#);
        assert!(matches!(
            removed.state(),
            TransferState::Failed(TransferError::Permanent { .. })
        ));
    }

    #[test]
    fn test_status_lengths_are_strings() {
        let parsed = status(
            r#"{"status":"active","totalLength":"2048","completedLength":"512","files":[{"path":"/tmp/x.epub"}]}"#,
        );
        assert_eq!(parsed.total(), Some(2048));
        assert_eq!(parsed.completed(), 512);
        assert_eq!(parsed.output_path(), Some(PathBuf::from("/tmp/x.epub")));
    }

    #[test]
    fn test_zero_total_is_unknown() {
        assert_eq!(status(r#"{"status":"waiting","totalLength":"0"}"#).total(), None);
    }

    #[test]
    fn test_endpoint_from_settings() {
        let driver = ExternalDriver::new(&ExternalSettings {
            host: "10.0.0.2".to_string(),
            port: 6801,
            secret: Some(String::new()),
        })
        .unwrap();
        assert_eq!(driver.endpoint().as_str(), "http://10.0.0.2:6801/jsonrpc");
        assert!(driver.secret.is_none());
    }

    #[test]
    fn test_rpc_transport_error_is_backend_unavailable() {
        let error = RpcError::Transport("connection refused".to_string()).into_transfer_error();
        assert!(matches!(error, TransferError::BackendUnavailable { .. }));
    }
}
