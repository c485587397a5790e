//! Certification queue.
//!
//! Jobs are certified strictly in insertion order with a fixed pause between
//! calls. Every status change is written to disk, so a restart resumes
//! unfinished work; items caught mid-flight are re-queued on load.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::certifiers::CertifierRegistry;
use crate::record::{CertifyRequest, CertifyResponse};

/// Characters escaped when a seed id is placed in a single path segment.
const SEED_ID_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    pub seed: CertifyRequest,
    pub certifier: String,
    pub status: QueueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub enqueued_at: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("please select a certifier")]
    MissingCertifier,
    #[error("seed {0} is already queued")]
    AlreadyQueued(String),
    #[error("queue storage error: {0}")]
    Storage(String),
    #[error("queue worker has stopped")]
    WorkerGone,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Seed ids in the order they were sent.
    pub order: Vec<String>,
}

/// Sends one certification request; implemented over HTTP by [`ProxyClient`].
pub trait Certify: Send + Sync {
    fn certify(&self, req: &CertifyRequest) -> anyhow::Result<CertifyResponse>;
}

pub struct CertifyQueue {
    path: Option<PathBuf>,
    items: Vec<QueueItem>,
}

impl CertifyQueue {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            items: Vec::new(),
        }
    }

    /// Open the queue persisted at `path`, creating an empty one if absent.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let mut items: Vec<QueueItem> = if path.exists() {
            let bytes = fs::read(path).map_err(|e| QueueError::Storage(e.to_string()))?;
            serde_json::from_slice(&bytes).map_err(|e| QueueError::Storage(e.to_string()))?
        } else {
            Vec::new()
        };
        for item in items.iter_mut().filter(|i| i.status == QueueStatus::Processing) {
            warn!("re-queueing interrupted item {}", item.seed.seed_id);
            item.status = QueueStatus::Queued;
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            items,
        })
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn pending(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == QueueStatus::Queued)
            .count()
    }

    fn save(&self) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write = || -> anyhow::Result<()> {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&self.items)?)?;
            fs::rename(&tmp, path)?;
            Ok(())
        };
        write().map_err(|e| QueueError::Storage(e.to_string()))
    }

    /// Append a job.
    ///
    /// # Errors
    /// Rejects a blank certifier or a seed that is already waiting or in flight.
    pub fn enqueue(&mut self, seed: CertifyRequest, certifier: &str) -> Result<(), QueueError> {
        if certifier.trim().is_empty() {
            return Err(QueueError::MissingCertifier);
        }
        let active = self.items.iter().any(|i| {
            i.seed.seed_id == seed.seed_id
                && matches!(i.status, QueueStatus::Queued | QueueStatus::Processing)
        });
        if active {
            return Err(QueueError::AlreadyQueued(seed.seed_id));
        }
        info!("seed {} added to queue", seed.seed_id);
        self.items.push(QueueItem {
            seed,
            certifier: certifier.to_string(),
            status: QueueStatus::Queued,
            error: None,
            transaction_id: None,
            enqueued_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        self.save()
    }

    /// # Errors
    /// Returns an error when the emptied queue cannot be persisted.
    pub fn clear(&mut self) -> Result<(), QueueError> {
        self.items.clear();
        self.save()
    }

    fn set_status(&mut self, idx: usize, status: QueueStatus) -> Result<(), QueueError> {
        self.items[idx].status = status;
        self.save()
    }
}

fn sign_request(
    registry: &CertifierRegistry,
    item: &QueueItem,
) -> anyhow::Result<CertifyRequest> {
    let signed = registry
        .sign_hash(&item.seed.hash, &item.certifier)
        .map_err(|e| anyhow!("Invalid signer: {e}"))?;
    let mut req = item.seed.clone();
    req.signature = signed.signature_hex;
    req.public_key = signed.public_key_hex;
    req.signer_name = signed.signer_name;
    Ok(req)
}

/// Walk the queue once in insertion order, then keep only the failures.
///
/// # Errors
/// Returns an error only when the queue cannot be persisted; certification
/// failures are recorded on the item instead.
pub async fn run_pass(
    queue: &mut CertifyQueue,
    certify: Arc<dyn Certify>,
    registry: Arc<CertifierRegistry>,
    delay: Duration,
) -> Result<PassSummary, QueueError> {
    let mut summary = PassSummary::default();

    for idx in 0..queue.items.len() {
        if queue.items[idx].status != QueueStatus::Queued {
            continue;
        }
        queue.set_status(idx, QueueStatus::Processing)?;
        let item = queue.items[idx].clone();
        summary.processed += 1;
        summary.order.push(item.seed.seed_id.clone());

        let certify = certify.clone();
        let registry = registry.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let req = sign_request(&registry, &item)?;
            certify.certify(&req)
        })
        .await
        .map_err(|e| anyhow!("certify task failed: {e}"))
        .and_then(|r| r);

        let seed_id = queue.items[idx].seed.seed_id.clone();
        match outcome {
            Ok(resp) if resp.success => {
                info!("seed {seed_id} certified successfully tx={}", resp.transaction_id);
                queue.items[idx].transaction_id = Some(resp.transaction_id);
                queue.items[idx].error = None;
                queue.set_status(idx, QueueStatus::Completed)?;
                summary.completed += 1;
            }
            Ok(resp) => {
                warn!("seed {seed_id} certification rejected: {}", resp.message);
                queue.items[idx].error = Some(resp.message);
                queue.set_status(idx, QueueStatus::Failed)?;
                summary.failed += 1;
            }
            Err(e) => {
                warn!("seed {seed_id} certification failed: {e}");
                queue.items[idx].error = Some(e.to_string());
                queue.set_status(idx, QueueStatus::Failed)?;
                summary.failed += 1;
            }
        }

        tokio::time::sleep(delay).await;
    }

    queue.items.retain(|i| i.status == QueueStatus::Failed);
    queue.save()?;
    info!(
        "queue processing complete: {} certified, {} failed",
        summary.completed, summary.failed
    );
    Ok(summary)
}

enum Command {
    Enqueue {
        seed: CertifyRequest,
        certifier: String,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Process {
        reply: oneshot::Sender<Result<PassSummary, QueueError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<QueueItem>>,
    },
}

/// Background task that owns the queue; talk to it through [`QueueHandle`].
pub struct QueueWorker;

impl QueueWorker {
    pub fn spawn(
        mut queue: CertifyQueue,
        certify: Arc<dyn Certify>,
        registry: Arc<CertifierRegistry>,
        delay: Duration,
    ) -> QueueHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Enqueue {
                        seed,
                        certifier,
                        reply,
                    } => {
                        let _ = reply.send(queue.enqueue(seed, &certifier));
                    }
                    Command::Process { reply } => {
                        let res =
                            run_pass(&mut queue, certify.clone(), registry.clone(), delay).await;
                        let _ = reply.send(res);
                    }
                    Command::Clear { reply } => {
                        let _ = reply.send(queue.clear());
                    }
                    Command::Snapshot { reply } => {
                        let _ = reply.send(queue.items().to_vec());
                    }
                }
            }
        });
        QueueHandle { tx }
    }
}

#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
}

impl QueueHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| QueueError::WorkerGone)?;
        rx.await.map_err(|_| QueueError::WorkerGone)
    }

    /// # Errors
    /// See [`CertifyQueue::enqueue`].
    pub async fn enqueue(&self, seed: CertifyRequest, certifier: &str) -> Result<(), QueueError> {
        let certifier = certifier.to_string();
        self.request(|reply| Command::Enqueue {
            seed,
            certifier,
            reply,
        })
        .await?
    }

    /// # Errors
    /// See [`run_pass`].
    pub async fn process(&self) -> Result<PassSummary, QueueError> {
        self.request(|reply| Command::Process { reply }).await?
    }

    /// # Errors
    /// Returns an error when the worker is gone or the queue cannot be persisted.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Clear { reply }).await?
    }

    /// # Errors
    /// Returns an error when the worker is gone.
    pub async fn snapshot(&self) -> Result<Vec<QueueItem>, QueueError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

/// HTTP client for a running gateway proxy.
pub struct ProxyClient {
    base: String,
    agent: ureq::Agent,
}

impl ProxyClient {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    fn verify_url(&self, seed_id: &str) -> String {
        format!(
            "{}/verify/{}",
            self.base,
            utf8_percent_encode(seed_id, SEED_ID_SEGMENT)
        )
    }

    /// Look a seed up through `GET /verify/:seedId`.
    ///
    /// # Errors
    /// Returns the proxy's error message for any non-2xx response.
    pub fn verify(&self, seed_id: &str) -> anyhow::Result<Value> {
        match self
            .agent
            .get(&self.verify_url(seed_id))
            .call()
        {
            Ok(r) => Ok(r.into_json()?),
            Err(ureq::Error::Status(code, r)) => Err(anyhow!(
                "verify failed ({code}): {}",
                error_message(r.into_string().unwrap_or_default())
            )),
            Err(e) => Err(anyhow!("verify failed: {e}")),
        }
    }
}

fn error_message(body: String) -> String {
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body)
}

impl Certify for ProxyClient {
    fn certify(&self, req: &CertifyRequest) -> anyhow::Result<CertifyResponse> {
        match self
            .agent
            .post(&format!("{}/certify", self.base))
            .send_json(req)
        {
            Ok(r) => Ok(r.into_json()?),
            Err(ureq::Error::Status(409, _)) => {
                Err(anyhow!("duplicate image: seed already certified"))
            }
            Err(ureq::Error::Status(code, r)) => Err(anyhow!(
                "certify failed ({code}): {}",
                error_message(r.into_string().unwrap_or_default())
            )),
            Err(e) => Err(anyhow!("certify failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records call order and fails the seed ids it is told to.
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: HashSet<String>,
    }

    impl Recorder {
        fn new(fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    impl Certify for Recorder {
        fn certify(&self, req: &CertifyRequest) -> anyhow::Result<CertifyResponse> {
            assert!(!req.signature.is_empty(), "queue must sign before sending");
            self.calls.lock().unwrap().push(req.seed_id.clone());
            if self.fail.contains(&req.seed_id) {
                return Err(anyhow!("endorsement failed"));
            }
            Ok(CertifyResponse {
                success: true,
                message: "Seed certified on blockchain".into(),
                seed_id: req.seed_id.clone(),
                transaction_id: format!("tx-{}", req.seed_id),
                ledger_type: "fabric".into(),
            })
        }
    }

    fn seed(id: &str) -> CertifyRequest {
        CertifyRequest::new(id, "healthy", "abcd", "2024-01-01T00:00:00Z")
    }

    fn registry() -> Arc<CertifierRegistry> {
        Arc::new(CertifierRegistry::with_defaults().unwrap())
    }

    #[tokio::test]
    async fn fifo_order_and_only_failures_remain() {
        let mut q = CertifyQueue::in_memory();
        for id in ["a", "b", "c", "d"] {
            q.enqueue(seed(id), "Nursery_A").unwrap();
        }
        let rec = Recorder::new(&["b", "d"]);
        let summary = run_pass(&mut q, rec.clone(), registry(), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(*rec.calls.lock().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(summary.order, vec!["a", "b", "c", "d"]);
        assert_eq!((summary.completed, summary.failed), (2, 2));
        let left: Vec<_> = q.items().iter().map(|i| i.seed.seed_id.as_str()).collect();
        assert_eq!(left, vec!["b", "d"]);
        assert!(q.items().iter().all(|i| i.status == QueueStatus::Failed));
        assert_eq!(q.items()[0].error.as_deref(), Some("endorsement failed"));
    }

    #[tokio::test]
    async fn unknown_certifier_fails_the_item() {
        let mut q = CertifyQueue::in_memory();
        q.enqueue(seed("a"), "Nursery_Z").unwrap();
        let rec = Recorder::new(&[]);
        let summary = run_pass(&mut q, rec.clone(), registry(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(rec.calls.lock().unwrap().is_empty());
        assert!(q.items()[0]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Invalid signer")));
    }

    #[test]
    fn enqueue_rules() {
        let mut q = CertifyQueue::in_memory();
        assert_eq!(q.enqueue(seed("a"), " "), Err(QueueError::MissingCertifier));
        q.enqueue(seed("a"), "Nursery_A").unwrap();
        assert_eq!(
            q.enqueue(seed("a"), "Nursery_B"),
            Err(QueueError::AlreadyQueued("a".into()))
        );
        assert_eq!(q.pending(), 1);
        q.clear().unwrap();
        assert!(q.items().is_empty());
    }

    #[test]
    fn reload_resumes_interrupted_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        {
            let mut q = CertifyQueue::open(&path).unwrap();
            q.enqueue(seed("a"), "Nursery_A").unwrap();
            q.enqueue(seed("b"), "Nursery_A").unwrap();
            q.set_status(0, QueueStatus::Processing).unwrap();
        }
        let q = CertifyQueue::open(&path).unwrap();
        assert_eq!(q.items().len(), 2);
        assert_eq!(q.pending(), 2);
        assert_eq!(q.items()[0].seed.seed_id, "a");
    }

    #[test]
    fn verify_url_keeps_seed_id_in_one_segment() {
        let client = ProxyClient::new("http://proxy:3000/");
        assert_eq!(client.verify_url("seed-001"), "http://proxy:3000/verify/seed-001");
        assert_eq!(client.verify_url("farm/42"), "http://proxy:3000/verify/farm%2F42");
        assert_eq!(client.verify_url("a?b#c"), "http://proxy:3000/verify/a%3Fb%23c");
        assert_eq!(client.verify_url("lot 7%"), "http://proxy:3000/verify/lot%207%25");
    }

    #[tokio::test]
    async fn worker_handles_commands_in_order() {
        let rec = Recorder::new(&["y"]);
        let handle = QueueWorker::spawn(CertifyQueue::in_memory(), rec.clone(), registry(), Duration::ZERO);
        handle.enqueue(seed("x"), "Nursery_A").await.unwrap();
        handle.enqueue(seed("y"), "Nursery_B").await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().len(), 2);

        let summary = handle.process().await.unwrap();
        assert_eq!(summary.order, vec!["x", "y"]);
        let left = handle.snapshot().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].seed.seed_id, "y");

        handle.clear().await.unwrap();
        assert!(handle.snapshot().await.unwrap().is_empty());
    }
}
