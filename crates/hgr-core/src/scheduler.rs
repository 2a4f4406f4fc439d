//! The workload control loop.
//!
//! Each iteration replaces the current [`State`] with the next one. States
//! carry exactly what their transition needs; there is no other scheduling
//! state. Workloads run strictly one at a time.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hgr_config::Config;
use hgr_db::{EventRepository, MetricsStore};
use hgr_types::{CompletionReport, Credentials, HangarError, Result, Workload};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::pack_directory;
use crate::container::exec::workload_exec;
use crate::container::{BuildSpec, ContainerRuntime, ExecProtocol, RunPlan, RunSpec, Streams};
use crate::control_plane::CompletionUploader;
use crate::downloader::{Fetch, WorkFetcher};
use crate::ledger::ResourceLedger;
use crate::mount_security::workload_mounts;
use crate::sampler::LoadSampler;
use crate::spool::{Spool, SpoolEntry, ARCHIVE_FILE};
use crate::utils::GracefulShutdown;
use crate::workspace::Workspace;

pub const ENV_RUN_ID: &str = "HANGAR_RUN_ID";
pub const ENV_ACCOUNT_ID: &str = "HANGAR_ACCOUNT_ID";
pub const ENV_TTL_MS: &str = "HANGAR_TTL_MS";
pub const ENV_LOG_LEVEL: &str = "HANGAR_LOG_LEVEL";
pub const ENV_TOKEN: &str = "HANGAR_TOKEN";

/// A workload whose container is up and ready for exec.
pub struct Run {
    pub run_id: Uuid,
    pub workload: Workload,
    pub workspace: Workspace,
    pub plan: RunPlan,
}

/// A run that has ended, successfully or not.
pub struct Finished {
    pub run: Run,
    pub duration: Duration,
    /// `None` on success.
    pub cause: Option<HangarError>,
}

pub enum State {
    Recovering,
    Idle,
    BeginWork(SpoolEntry),
    Running(Box<Run>),
    Completed(Box<Finished>),
    Discard {
        id: Uuid,
        workspace: Option<Workspace>,
        next: Box<State>,
    },
    Failure {
        cause: HangarError,
        next: Box<State>,
    },
    Delay {
        duration: Duration,
        next: Box<State>,
    },
    Terminated(HangarError),
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Recovering => "recovering",
            Self::Idle => "idle",
            Self::BeginWork(_) => "begin-work",
            Self::Running(_) => "running",
            Self::Completed(_) => "completed",
            Self::Discard { .. } => "discard",
            Self::Failure { .. } => "failure",
            Self::Delay { .. } => "delay",
            Self::Terminated(_) => "terminated",
        }
    }

    fn failure(cause: HangarError, next: State) -> Self {
        Self::Failure {
            cause,
            next: Box::new(next),
        }
    }

    fn delay(duration: Duration, next: State) -> Self {
        Self::Delay {
            duration,
            next: Box::new(next),
        }
    }

    fn discard(id: Uuid, workspace: Option<Workspace>) -> Self {
        Self::Discard {
            id,
            workspace,
            next: Box::new(Self::Idle),
        }
    }
}

pub struct Scheduler {
    config: Config,
    spool: Spool,
    ledger: Arc<ResourceLedger>,
    protocol: ExecProtocol,
    fetcher: Arc<dyn WorkFetcher>,
    uploader: Arc<dyn CompletionUploader>,
    shutdown: Arc<GracefulShutdown>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        spool: Spool,
        ledger: Arc<ResourceLedger>,
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn WorkFetcher>,
        uploader: Arc<dyn CompletionUploader>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        let protocol = ExecProtocol::new(
            runtime,
            config.exec_poll_interval(),
            config.stop_timeout(),
            config.cleanup_timeout(),
        );
        Self {
            config,
            spool,
            ledger,
            protocol,
            fetcher,
            uploader,
            shutdown,
        }
    }

    /// Drive the loop until it terminates and return why.
    pub async fn run(&self) -> HangarError {
        info!(spool = %self.spool.root().display(), "Scheduler started");
        let mut state = State::Recovering;
        loop {
            debug!(state = state.name(), "Scheduler transition");
            state = match state {
                State::Terminated(cause) => {
                    info!(cause = %cause, "Scheduler terminated");
                    return cause;
                }
                other => self.update(other).await,
            };
        }
    }

    /// Perform one transition.
    pub async fn update(&self, state: State) -> State {
        match state {
            State::Recovering => self.recover().await,
            State::Idle => self.idle().await,
            State::BeginWork(entry) => self.begin_work(entry).await,
            State::Running(run) => self.running(*run).await,
            State::Completed(finished) => self.completed(*finished).await,
            State::Discard {
                id,
                workspace,
                next,
            } => self.discard(id, workspace, *next).await,
            State::Failure { cause, next } => {
                error!(error = %cause, "Scheduler step failed");
                *next
            }
            State::Delay { duration, next } => match self.shutdown.sleep(duration).await {
                Ok(()) => *next,
                Err(cause) => State::Terminated(cause),
            },
            State::Terminated(cause) => State::Terminated(cause),
        }
    }

    async fn recover(&self) -> State {
        match self.spool.recover().await {
            Ok(ids) => {
                for id in ids {
                    warn!(%id, "Requeued workload interrupted by a previous crash");
                }
                State::Idle
            }
            Err(e) => State::failure(e, State::Idle),
        }
    }

    async fn idle(&self) -> State {
        if let Some(cause) = self.shutdown.cause() {
            return State::Terminated(HangarError::Cancelled(cause));
        }

        let retry = || State::delay(self.config.idle_retry(), State::Idle);
        match self.spool.dequeue().await {
            Ok(Some(entry)) => State::BeginWork(entry),
            Ok(None) => match self.fetcher.fetch(&self.shutdown).await {
                Ok(Fetch::Fetched(id)) => {
                    debug!(%id, "New work fetched");
                    State::Idle
                }
                Ok(Fetch::Empty | Fetch::Skipped) => {
                    State::delay(self.config.poll_interval(), State::Idle)
                }
                Err(e) if e.is_cancellation() => State::Terminated(e),
                Err(e) => State::failure(e, retry()),
            },
            Err(e) => State::failure(e, retry()),
        }
    }

    async fn begin_work(&self, entry: SpoolEntry) -> State {
        let id = entry.id;
        let (workload, credentials) = match read_entry(&entry).await {
            Ok(v) => v,
            Err(e) => return State::failure(e, State::discard(id, None)),
        };
        let workspace = match Workspace::prepare(&self.config.workspaces_dir, id).await {
            Ok(ws) => ws,
            Err(e) => return State::failure(e, State::discard(id, None)),
        };

        match self.materialize(&entry, &workload, &credentials, &workspace).await {
            Ok(run) => {
                info!(%id, run_id = %run.run_id, entry = %workload.entry, "Workload started");
                State::Running(Box::new(run))
            }
            Err(e) => {
                warn!(%id, error = %e, "Workload setup failed, discarding");
                State::failure(e, State::discard(id, Some(workspace)))
            }
        }
    }

    /// Unpack, build and start the container.
    async fn materialize(
        &self,
        entry: &SpoolEntry,
        workload: &Workload,
        credentials: &Credentials,
        workspace: &Workspace,
    ) -> Result<Run> {
        workspace.unpack(&entry.archive_path()).await?;
        let run_id = Uuid::new_v4();
        let plan = plan_run(&self.config, run_id, workload, credentials, workspace).await?;

        self.protocol.prepare(&plan).await?;
        Ok(Run {
            run_id,
            workload: workload.clone(),
            workspace: workspace.clone(),
            plan,
        })
    }

    async fn running(&self, run: Run) -> State {
        let limits = run.workload.limits();
        let reserved = self.ledger.reserve(limits);
        debug!(id = %run.workload.id, %reserved, "Resources reserved for run");

        let started = Instant::now();
        let cause = self.execute(&run).await.err();
        let duration = started.elapsed();

        State::Completed(Box::new(Finished {
            run,
            duration,
            cause,
        }))
    }

    /// Exec the workload with output captured to the workspace and host
    /// load sampled into its metrics store.
    async fn execute(&self, run: &Run) -> Result<()> {
        let streams = match Streams::capture(&run.workspace.logs_path()).await {
            Ok(s) => s,
            Err(e) => {
                self.protocol.cleanup(&run.plan).await;
                return Err(e);
            }
        };

        let store = match MetricsStore::open(&run.workspace.analytics_path()).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(id = %run.workload.id, error = %e, "Metrics store unavailable, running without it");
                None
            }
        };
        if let Some(store) = &store {
            record_event(store, "exec_started", None).await;
        }

        let stop = CancellationToken::new();
        let sampling = async {
            match &store {
                Some(store) => {
                    LoadSampler::new(self.config.sample_interval())
                        .run(store, stop.clone())
                        .await
                }
                None => 0,
            }
        };
        let execution = async {
            let outcome = self.protocol.execute(&run.plan, streams, &self.shutdown).await;
            stop.cancel();
            outcome
        };
        let (samples, outcome) = tokio::join!(sampling, execution);

        if let Some(store) = store {
            let detail = match &outcome {
                Ok(()) => format!("ok, {samples} samples"),
                Err(e) => e.to_string(),
            };
            record_event(&store, "exec_finished", Some(&detail)).await;
            store.close().await;
        }
        outcome
    }

    async fn completed(&self, finished: Finished) -> State {
        let Finished {
            run,
            duration,
            cause,
        } = finished;
        let id = run.workload.id;
        self.ledger.release(run.workload.limits());

        let successful = cause.is_none();
        match &cause {
            None => info!(%id, duration_ms = duration.as_millis() as u64, "Workload succeeded"),
            Some(e) => warn!(%id, duration_ms = duration.as_millis() as u64, cause = %e, "Workload failed"),
        }

        let logs = run.workspace.read_logs().await.unwrap_or_else(|e| {
            warn!(%id, error = %e, "Failed to read run logs");
            Vec::new()
        });
        let analytics = run.workspace.read_analytics().await.unwrap_or_else(|e| {
            warn!(%id, error = %e, "Failed to read run metrics");
            Vec::new()
        });

        let report = CompletionReport {
            workload_id: id,
            duration,
            successful,
            cause: cause.map(|e| e.to_string()),
            logs,
            analytics,
        };
        match self.uploader.upload_completion(&report).await {
            Ok(()) => {
                debug!(%id, "Completion uploaded");
                if successful {
                    self.fetcher.reset_backoff();
                }
            }
            Err(e) => error!(%id, error = %e, "Completion upload failed"),
        }

        State::discard(id, Some(run.workspace))
    }

    async fn discard(&self, id: Uuid, workspace: Option<Workspace>, next: State) -> State {
        if let Err(e) = self.spool.completed(id).await {
            error!(%id, error = %e, "Failed to remove spool entry");
        }
        if let Some(workspace) = workspace {
            if let Err(e) = workspace.remove().await {
                warn!(%id, error = %e, "Failed to remove workspace");
            }
        }
        debug!(%id, "Workload discarded");
        next
    }
}

/// Build the plan for a workload whose source is already unpacked into
/// `workspace`. The access token goes into the workspace env file; the rest
/// of the environment is plain.
async fn plan_run(
    config: &Config,
    run_id: Uuid,
    workload: &Workload,
    credentials: &Credentials,
    workspace: &Workspace,
) -> Result<RunPlan> {
    let definition = workspace.image_definition(&config.base_image).await?;

    let mut env = BTreeMap::new();
    env.insert(ENV_RUN_ID.to_string(), run_id.to_string());
    env.insert(ENV_ACCOUNT_ID.to_string(), workload.account_id.clone());
    env.insert(ENV_TTL_MS.to_string(), workload.ttl.to_string());
    env.insert(ENV_LOG_LEVEL.to_string(), config.log_level.clone());
    let env_file = if credentials.token.is_empty() {
        None
    } else {
        let secrets = BTreeMap::from([(ENV_TOKEN.to_string(), credentials.token.clone())]);
        Some(workspace.write_env_file(&secrets).await?)
    };

    Ok(RunPlan {
        workload_id: workload.id,
        build: BuildSpec {
            tag: workload.image_tag(),
            definition,
            context: workspace.source_dir(),
        },
        run: RunSpec {
            name: workload.container_name(),
            image: workload.image_tag(),
            env,
            env_file,
            mounts: workload_mounts(&workspace.source_dir(), &config.runtime_binary)?,
            limits: workload.limits(),
            network: config.container_network.clone(),
        },
        exec: workload_exec(&workload.entry, BTreeMap::new()),
        ttl: workload.ttl(),
    })
}

/// Run one workload from a local directory in the foreground, attached to
/// `streams`, bypassing the spool. The workspace is removed afterwards.
pub async fn run_local(
    config: &Config,
    runtime: Arc<dyn ContainerRuntime>,
    workload: &Workload,
    source: &Path,
    streams: Streams,
    shutdown: &GracefulShutdown,
) -> Result<()> {
    let workspace = Workspace::prepare(&config.workspaces_dir, workload.id).await?;
    let protocol = ExecProtocol::new(
        runtime,
        config.exec_poll_interval(),
        config.stop_timeout(),
        config.cleanup_timeout(),
    );

    let outcome = async {
        let source = source.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || pack_directory(&source))
            .await
            .map_err(|e| HangarError::Other(format!("Packaging task failed: {e}")))??;
        let archive_path = workspace.path().join(ARCHIVE_FILE);
        tokio::fs::write(&archive_path, archive).await?;
        workspace.unpack(&archive_path).await?;
        tokio::fs::remove_file(&archive_path).await?;

        let plan = plan_run(config, Uuid::new_v4(), workload, &Credentials::default(), &workspace)
            .await?;
        protocol.prepare(&plan).await?;
        info!(id = %workload.id, entry = %workload.entry, tty = streams.terminal, "Running locally");
        protocol.execute(&plan, streams, shutdown).await
    }
    .await;

    if let Err(e) = workspace.remove().await {
        warn!(id = %workload.id, error = %e, "Failed to remove workspace");
    }
    outcome
}

async fn read_entry(entry: &SpoolEntry) -> Result<(Workload, Credentials)> {
    let raw = tokio::fs::read(entry.metadata_path()).await.map_err(|e| {
        HangarError::Spool(format!("Failed to read metadata for {}: {e}", entry.id))
    })?;
    let workload: Workload = serde_json::from_slice(&raw)?;
    if workload.id != entry.id {
        return Err(HangarError::Spool(format!(
            "Metadata id {} does not match spool entry {}",
            workload.id, entry.id
        )));
    }

    let credentials = match tokio::fs::read(entry.credentials_path()).await {
        Ok(raw) => serde_json::from_slice(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Credentials::default(),
        Err(e) => return Err(e.into()),
    };
    Ok((workload, credentials))
}

async fn record_event(store: &MetricsStore, kind: &str, detail: Option<&str>) {
    if let Err(e) = EventRepository::new(store).record(kind, detail).await {
        warn!(kind, error = %e, "Failed to record run event");
    }
}
