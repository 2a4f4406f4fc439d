//! Admission side: pulls at most one workload at a time into the spool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hgr_config::Config;
use hgr_types::{Arch, Assignment, Credentials, HangarError, Os, Result, WorkRequest};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control_plane::WorkSource;
use crate::ledger::ResourceLedger;
use crate::spool::{Spool, ARCHIVE_FILE, CREDENTIALS_FILE, METADATA_FILE};
use crate::utils::{Backoff, GracefulShutdown};

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// Something is already queued or running.
    Skipped,
    /// The source had nothing matching.
    Empty,
    /// A workload was downloaded and queued.
    Fetched(Uuid),
}

/// What the scheduler calls when its queue is empty.
#[async_trait]
pub trait WorkFetcher: Send + Sync {
    async fn fetch(&self, shutdown: &GracefulShutdown) -> Result<Fetch>;

    /// Called after a successful run.
    fn reset_backoff(&self) {}
}

struct BackoffState {
    backoff: Backoff,
    /// Delay owed before the next request, set by a failure.
    pending: Option<Duration>,
}

pub struct Downloader {
    spool: Spool,
    source: Arc<dyn WorkSource>,
    ledger: Arc<ResourceLedger>,
    os: Os,
    arch: Arch,
    state: Mutex<BackoffState>,
}

impl Downloader {
    pub fn new(
        spool: Spool,
        source: Arc<dyn WorkSource>,
        ledger: Arc<ResourceLedger>,
        os: Os,
        arch: Arch,
        backoff: Backoff,
    ) -> Self {
        Self {
            spool,
            source,
            ledger,
            os,
            arch,
            state: Mutex::new(BackoffState {
                backoff,
                pending: None,
            }),
        }
    }

    pub fn from_config(
        config: &Config,
        spool: Spool,
        source: Arc<dyn WorkSource>,
        ledger: Arc<ResourceLedger>,
    ) -> Self {
        let backoff = Backoff::with_delays(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        Self::new(spool, source, ledger, config.node_os, config.node_arch, backoff)
    }

    /// Delay the next failure would impose.
    pub fn next_backoff(&self) -> Duration {
        self.state.lock().backoff.peek()
    }

    /// Wait until the ledger has some free capacity in both dimensions.
    async fn wait_for_capacity(&self, shutdown: &GracefulShutdown) -> Result<WorkRequest> {
        loop {
            let available = self.ledger.available();
            if !available.is_zero() {
                return Ok(WorkRequest {
                    os: self.os,
                    arch: self.arch,
                    cores: available.cores,
                    memory: available.memory,
                });
            }
            debug!(reserved = %self.ledger.snapshot(), "No free capacity, waiting for a release");
            tokio::select! {
                _ = self.ledger.released() => {}
                cause = shutdown.cancelled() => return Err(HangarError::Cancelled(cause)),
            }
        }
    }

    async fn download(&self, request: &WorkRequest) -> Result<Option<Uuid>> {
        let Some(assignment) = self.source.request_work(request).await? else {
            return Ok(None);
        };
        let id = assignment.workload.id;

        if let Err(e) = self.store(&assignment).await {
            if let Err(abandon_err) = self.spool.abandon(id).await {
                warn!(%id, error = %abandon_err, "Failed to drop partial download");
            }
            return Err(e);
        }
        self.spool.enqueue(id).await?;
        Ok(Some(id))
    }

    async fn store(&self, assignment: &Assignment) -> Result<()> {
        let id = assignment.workload.id;
        let archive = self.source.fetch_archive(id).await?;
        self.spool.download(id, ARCHIVE_FILE, &archive).await?;

        let metadata = serde_json::to_vec_pretty(&assignment.workload)?;
        self.spool.download(id, METADATA_FILE, &metadata).await?;

        let credentials = Credentials {
            token: assignment.token.clone(),
        };
        self.spool
            .download(id, CREDENTIALS_FILE, &serde_json::to_vec(&credentials)?)
            .await?;

        info!(%id, archive_bytes = archive.len(), entry = %assignment.workload.entry, "Workload downloaded");
        Ok(())
    }
}

#[async_trait]
impl WorkFetcher for Downloader {
    async fn fetch(&self, shutdown: &GracefulShutdown) -> Result<Fetch> {
        if !self.spool.is_idle().await? {
            return Ok(Fetch::Skipped);
        }

        let request = self.wait_for_capacity(shutdown).await?;

        let pending = self.state.lock().pending.take();
        if let Some(delay) = pending {
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before next request");
            shutdown.sleep(delay).await?;
        }

        match self.download(&request).await {
            Ok(found) => {
                self.state.lock().backoff.reset();
                Ok(found.map_or(Fetch::Empty, Fetch::Fetched))
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                let (delay, failures) = {
                    let mut state = self.state.lock();
                    let delay = state.backoff.next_delay();
                    state.pending = Some(delay);
                    (delay, state.backoff.failures())
                };
                warn!(
                    error = %e,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Work request failed"
                );
                Err(e)
            }
        }
    }

    fn reset_backoff(&self) {
        let mut state = self.state.lock();
        state.backoff.reset();
        state.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hgr_types::{Limits, StopCause, Workload};
    use tokio::time::Instant;

    use super::*;
    use crate::spool::Location;

    /// Fails the first `failures` requests, then hands out one workload per call.
    struct FlakySource {
        failures: AtomicUsize,
        requests: Mutex<Vec<WorkRequest>>,
        broken_archive: bool,
    }

    impl FlakySource {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                requests: Mutex::new(Vec::new()),
                broken_archive: false,
            }
        }
    }

    #[async_trait]
    impl WorkSource for FlakySource {
        async fn request_work(&self, request: &WorkRequest) -> Result<Option<Assignment>> {
            self.requests.lock().push(request.clone());
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(HangarError::Transport("connection refused".into()));
            }
            Ok(Some(Assignment {
                workload: Workload {
                    id: Uuid::new_v4(),
                    entry: "main.wasm".into(),
                    ttl: 3_600_000,
                    cores: 1,
                    memory: 536_870_912,
                    arch: Arch::Amd64,
                    os: Os::Linux,
                    allow_shared: false,
                    vcs_uri: String::new(),
                    account_id: "acct".into(),
                    labels: BTreeSet::new(),
                },
                token: "tok".into(),
            }))
        }

        async fn fetch_archive(&self, _id: Uuid) -> Result<Vec<u8>> {
            if self.broken_archive {
                return Err(HangarError::Transport("reset by peer".into()));
            }
            Ok(b"archive".to_vec())
        }
    }

    struct NoWork;

    #[async_trait]
    impl WorkSource for NoWork {
        async fn request_work(&self, _request: &WorkRequest) -> Result<Option<Assignment>> {
            Ok(None)
        }
        async fn fetch_archive(&self, id: Uuid) -> Result<Vec<u8>> {
            Err(HangarError::NotFound(id.to_string()))
        }
    }

    fn setup(source: Arc<dyn WorkSource>) -> (tempfile::TempDir, Spool, Arc<ResourceLedger>, Downloader) {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::open(tmp.path().join("spool")).unwrap();
        let ledger = Arc::new(ResourceLedger::new(Limits::new(4, 8 << 30)));
        let dl = Downloader::new(
            spool.clone(),
            source,
            ledger.clone(),
            Os::Linux,
            Arch::Amd64,
            Backoff::default(),
        );
        (tmp, spool, ledger, dl)
    }

    #[tokio::test]
    async fn fetch_writes_entry_and_queues_it() {
        let (_tmp, spool, _ledger, dl) = setup(Arc::new(FlakySource::new(0)));
        let shutdown = GracefulShutdown::new();

        let Fetch::Fetched(id) = dl.fetch(&shutdown).await.unwrap() else {
            panic!("expected a workload");
        };
        assert_eq!(spool.locate(id).await.unwrap(), Some(Location::Queued));
        let dir = spool.entry_path(Location::Queued, id);
        assert_eq!(std::fs::read(dir.join(ARCHIVE_FILE)).unwrap(), b"archive");
        let workload: Workload =
            serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(workload.id, id);
        let creds: Credentials =
            serde_json::from_slice(&std::fs::read(dir.join(CREDENTIALS_FILE)).unwrap()).unwrap();
        assert_eq!(creds.token, "tok");
    }

    #[tokio::test]
    async fn busy_spool_skips_request() {
        let source = Arc::new(FlakySource::new(0));
        let (_tmp, _spool, _ledger, dl) = setup(source.clone());
        let shutdown = GracefulShutdown::new();

        assert!(matches!(dl.fetch(&shutdown).await.unwrap(), Fetch::Fetched(_)));
        assert_eq!(dl.fetch(&shutdown).await.unwrap(), Fetch::Skipped);
        assert_eq!(source.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn empty_source() {
        let (_tmp, spool, _ledger, dl) = setup(Arc::new(NoWork));
        assert_eq!(dl.fetch(&GracefulShutdown::new()).await.unwrap(), Fetch::Empty);
        assert!(spool.is_idle().await.unwrap());
    }

    #[tokio::test]
    async fn request_advertises_free_capacity() {
        let source = Arc::new(FlakySource::new(0));
        let (_tmp, _spool, ledger, dl) = setup(source.clone());
        ledger.reserve(Limits::new(1, 1 << 30));

        dl.fetch(&GracefulShutdown::new()).await.unwrap();
        let sent = source.requests.lock()[0].clone();
        assert_eq!(sent.cores, 3);
        assert_eq!(sent.memory, 7 << 30);
        assert_eq!(sent.os, Os::Linux);
    }

    #[tokio::test]
    async fn partial_download_is_abandoned() {
        let mut source = FlakySource::new(0);
        source.broken_archive = true;
        let (_tmp, spool, _ledger, dl) = setup(Arc::new(source));

        assert!(dl.fetch(&GracefulShutdown::new()).await.is_err());
        assert!(spool.list(Location::Downloading).await.unwrap().is_empty());
        assert!(spool.is_idle().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_exponentially_then_reset() {
        let (_tmp, _spool, _ledger, dl) = setup(Arc::new(FlakySource::new(3)));
        let shutdown = GracefulShutdown::new();

        // First failure is immediate; it schedules the first delay.
        assert!(dl.fetch(&shutdown).await.is_err());

        let mut waits = Vec::new();
        for _ in 0..2 {
            let start = Instant::now();
            assert!(dl.fetch(&shutdown).await.is_err());
            waits.push(start.elapsed());
        }
        let start = Instant::now();
        assert!(matches!(dl.fetch(&shutdown).await.unwrap(), Fetch::Fetched(_)));
        waits.push(start.elapsed());

        assert_eq!(
            waits,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
        assert_eq!(dl.next_backoff(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_backoff_clears_pending_delay() {
        let (_tmp, _spool, _ledger, dl) = setup(Arc::new(FlakySource::new(1)));
        let shutdown = GracefulShutdown::new();
        assert!(dl.fetch(&shutdown).await.is_err());

        dl.reset_backoff();
        let start = Instant::now();
        dl.fetch(&shutdown).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_release_when_full() {
        let (_tmp, _spool, ledger, dl) = setup(Arc::new(FlakySource::new(0)));
        ledger.reserve(ledger.limit());

        let releaser = {
            let ledger = ledger.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ledger.release(Limits::new(2, 4 << 30));
            }
        };
        let start = Instant::now();
        let shutdown = GracefulShutdown::new();
        let (fetched, ()) = tokio::join!(dl.fetch(&shutdown), releaser);
        assert!(matches!(fetched.unwrap(), Fetch::Fetched(_)));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_wait_honours_cancellation() {
        let (_tmp, _spool, ledger, dl) = setup(Arc::new(FlakySource::new(0)));
        ledger.reserve(ledger.limit());
        let shutdown = GracefulShutdown::with_deadline(Duration::from_secs(1));

        let err = dl.fetch(&shutdown).await.unwrap_err();
        assert_eq!(err.stop_cause(), Some(StopCause::DeadlineExceeded));
    }
}
