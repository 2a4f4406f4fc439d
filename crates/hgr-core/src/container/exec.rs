//! Running one workload inside its container.
//!
//! Flow: build image (if missing) → run container detached → create exec →
//! attach (TTY or multiplexed) → poll until the exec stops → stop + remove.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hgr_types::{HangarError, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::demux::demux;
use super::runtime::{BuildSpec, ContainerRuntime, ExecSpec, ExecState, ExecStream, RunSpec};
use super::tty::{self, TerminalOptions};
use crate::mount_security::{CONTAINER_RUNTIME_PATH, CONTAINER_WORKDIR};
use crate::utils::GracefulShutdown;

/// Environment markers every workload container gets.
pub const ENV_CI: &str = "CI";
pub const ENV_RUNTIME: &str = "HANGAR_RUNTIME";

/// Everything needed to run one workload.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub workload_id: Uuid,
    pub build: BuildSpec,
    pub run: RunSpec,
    pub exec: ExecSpec,
    pub ttl: Duration,
}

impl RunPlan {
    pub fn container(&self) -> &str {
        &self.run.name
    }
}

/// Command that makes the embedded runtime execute `entry`.
pub fn runtime_command(entry: &str) -> Vec<String> {
    [
        CONTAINER_RUNTIME_PATH,
        "run",
        "--module",
        entry,
        "--workdir",
        CONTAINER_WORKDIR,
        "--module-dir",
        CONTAINER_WORKDIR,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

type Input = Box<dyn AsyncRead + Unpin + Send>;
type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Local ends of an exec session.
pub struct Streams {
    pub stdin: Option<Input>,
    pub stdout: Output,
    pub stderr: Output,
    /// Run the exec with a TTY: output arrives as one raw stream.
    pub terminal: bool,
    /// Local terminal handling for TTY sessions.
    pub terminal_options: TerminalOptions,
}

impl Streams {
    /// Capture stdout and stderr into `path`, appending.
    pub async fn capture(path: &Path) -> Result<Self> {
        let open = || async {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| {
                    HangarError::Other(format!("Failed to open log {}: {e}", path.display()))
                })
        };
        Ok(Self {
            stdin: None,
            stdout: Box::new(open().await?),
            stderr: Box::new(open().await?),
            terminal: false,
            terminal_options: TerminalOptions::default(),
        })
    }

    /// The process's own stdio. TTY mode, with the local terminal switched
    /// to raw mode, when both stdin and stdout are terminals.
    pub fn stdio() -> Self {
        let terminal = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
        Self {
            stdin: Some(Box::new(tokio::io::stdin())),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            terminal,
            terminal_options: TerminalOptions {
                raw_mode: terminal,
                size: None,
            },
        }
    }
}

/// Drives the container side of a run.
pub struct ExecProtocol {
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
    stop_timeout: Duration,
    cleanup_timeout: Duration,
}

impl ExecProtocol {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        poll_interval: Duration,
        stop_timeout: Duration,
        cleanup_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            poll_interval,
            stop_timeout,
            cleanup_timeout,
        }
    }

    /// Build the image if needed and start the container. A failed start is
    /// cleaned up before returning.
    pub async fn prepare(&self, plan: &RunPlan) -> Result<()> {
        if self.runtime.image_exists(&plan.build.tag).await? {
            debug!(tag = %plan.build.tag, "Image already built");
        } else {
            info!(tag = %plan.build.tag, "Building image");
            self.runtime.build_image(&plan.build).await?;
        }

        let mut run = plan.run.clone();
        run.env.insert(ENV_CI.to_string(), "true".to_string());
        run.env
            .insert(ENV_RUNTIME.to_string(), CONTAINER_RUNTIME_PATH.to_string());

        if let Err(e) = self.runtime.run_detached(&run).await {
            self.cleanup(plan).await;
            return Err(e);
        }
        info!(id = %plan.workload_id, container = %run.name, "Container started");
        Ok(())
    }

    /// Exec the workload, wait for it, then tear the container down.
    ///
    /// `Err(Workload)` for a non-zero exit, `Err(Timeout)` past the TTL,
    /// `Err(Cancelled)` when `shutdown` fires. Cleanup runs in every case.
    pub async fn execute(
        &self,
        plan: &RunPlan,
        streams: Streams,
        shutdown: &GracefulShutdown,
    ) -> Result<()> {
        let outcome = tokio::select! {
            res = self.exec_and_wait(plan, streams, shutdown) => res,
            _ = tokio::time::sleep(plan.ttl) => Err(HangarError::Timeout(format!(
                "workload exceeded its ttl of {}ms",
                plan.ttl.as_millis()
            ))),
        };
        self.cleanup(plan).await;
        outcome
    }

    async fn exec_and_wait(
        &self,
        plan: &RunPlan,
        streams: Streams,
        shutdown: &GracefulShutdown,
    ) -> Result<()> {
        let mut spec = plan.exec.clone();
        spec.tty = streams.terminal;
        spec.attach_stdin = streams.stdin.is_some();

        let exec_id = self.runtime.create_exec(plan.container(), &spec).await?;
        let stream = self.runtime.start_exec(&exec_id, spec.tty).await?;
        debug!(id = %plan.workload_id, exec_id, tty = spec.tty, "Exec attached");

        let attach = self.attach(&exec_id, stream, streams);
        tokio::select! {
            res = attach => res?,
            cause = shutdown.cancelled() => return Err(HangarError::Cancelled(cause)),
        }

        self.wait_for_exit(&exec_id, shutdown).await
    }

    async fn attach(&self, exec_id: &str, stream: ExecStream, streams: Streams) -> Result<()> {
        let Streams {
            stdin,
            mut stdout,
            mut stderr,
            terminal,
            terminal_options,
        } = streams;

        if terminal {
            return tty::run_session(
                self.runtime.as_ref(),
                exec_id,
                stream,
                stdin,
                &mut stdout,
                terminal_options,
            )
            .await;
        }

        let (mut rd, mut wr) = tokio::io::split(stream);
        let output = demux(&mut rd, &mut stdout, &mut stderr);
        let input = async {
            if let Some(mut stdin) = stdin {
                tokio::io::copy(&mut stdin, &mut wr).await?;
                wr.shutdown().await?;
            }
            Ok::<_, HangarError>(())
        };

        tokio::pin!(output, input);
        let mut input_done = false;
        loop {
            tokio::select! {
                res = &mut output => return res.map(|bytes| {
                    debug!(exec_id, bytes, "Exec output drained");
                }),
                res = &mut input, if !input_done => {
                    input_done = true;
                    if let Err(e) = res {
                        debug!(exec_id, error = %e, "Exec input closed");
                    }
                }
            }
        }
    }

    /// Poll the exec session until it stops.
    async fn wait_for_exit(&self, exec_id: &str, shutdown: &GracefulShutdown) -> Result<()> {
        loop {
            shutdown.check()?;
            match self.runtime.inspect_exec(exec_id).await {
                Ok(ExecState { running: true, .. }) => {}
                Ok(ExecState {
                    exit_code: None | Some(0),
                    ..
                }) => return Ok(()),
                Ok(ExecState {
                    exit_code: Some(code),
                    ..
                }) => return Err(HangarError::Workload { exit_code: code }),
                Err(HangarError::NotFound(_)) => {
                    debug!(exec_id, "Exec session gone, treating as finished");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            shutdown.sleep(self.poll_interval).await?;
        }
    }

    /// Stop and remove the container and its image. Bounded by its own
    /// timeout so it still runs after the run's deadline; failures are only
    /// logged.
    pub async fn cleanup(&self, plan: &RunPlan) {
        let name = plan.container();
        let work = async {
            if let Err(e) = self.runtime.stop_container(name, self.stop_timeout).await {
                warn!(container = name, error = %e, "Failed to stop container");
            }
            if let Err(e) = self.runtime.remove_container(name).await {
                warn!(container = name, error = %e, "Failed to remove container");
            }
            if let Err(e) = self.runtime.remove_image(&plan.build.tag).await {
                warn!(tag = %plan.build.tag, error = %e, "Failed to remove image");
            }
        };
        match tokio::time::timeout(self.cleanup_timeout, work).await {
            Ok(()) => debug!(container = name, "Container cleaned up"),
            Err(_) => warn!(
                container = name,
                timeout_secs = self.cleanup_timeout.as_secs(),
                "Container cleanup timed out"
            ),
        }
    }
}

/// Default exec spec for a workload entry.
pub fn workload_exec(entry: &str, env: BTreeMap<String, String>) -> ExecSpec {
    ExecSpec {
        cmd: runtime_command(entry),
        env,
        working_dir: CONTAINER_WORKDIR.to_string(),
        attach_stdin: false,
        tty: false,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use hgr_types::{Limits, StopCause};
    use parking_lot::Mutex;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::container::demux::{encode_frame, StreamTag};

    /// Scripted runtime: fixed output frames and a sequence of inspect results.
    struct ScriptedRuntime {
        output: Vec<u8>,
        inspects: Mutex<Vec<Result<ExecState>>>,
        calls: Mutex<Vec<String>>,
        fail_run: bool,
    }

    impl ScriptedRuntime {
        fn new(output: Vec<u8>, inspects: Vec<Result<ExecState>>) -> Self {
            Self {
                output,
                inspects: Mutex::new(inspects),
                calls: Mutex::new(Vec::new()),
                fail_run: false,
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn image_exists(&self, _tag: &str) -> Result<bool> {
            Ok(false)
        }
        async fn build_image(&self, spec: &BuildSpec) -> Result<()> {
            self.record(format!("build {}", spec.tag));
            Ok(())
        }
        async fn remove_image(&self, tag: &str) -> Result<()> {
            self.record(format!("rmi {tag}"));
            Ok(())
        }
        async fn run_detached(&self, spec: &RunSpec) -> Result<()> {
            self.record(format!(
                "run {} CI={}",
                spec.name,
                spec.env.get(ENV_CI).cloned().unwrap_or_default()
            ));
            if self.fail_run {
                return Err(HangarError::Container("port in use".into()));
            }
            Ok(())
        }
        async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
            self.record(format!(
                "exec {container} tty={} stdin={}",
                spec.tty, spec.attach_stdin
            ));
            Ok("exec-1".to_string())
        }
        async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<ExecStream> {
            self.record(format!("start {exec_id} tty={tty}"));
            let (client, mut server) = tokio::io::duplex(64);
            let output = self.output.clone();
            tokio::spawn(async move {
                let _ = server.write_all(&output).await;
            });
            Ok(Box::new(client))
        }
        async fn resize_exec(&self, exec_id: &str, h: u16, w: u16) -> Result<()> {
            self.record(format!("resize {exec_id} {h}x{w}"));
            Ok(())
        }
        async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecState> {
            let mut inspects = self.inspects.lock();
            if inspects.is_empty() {
                Ok(ExecState {
                    running: true,
                    exit_code: None,
                })
            } else {
                inspects.remove(0)
            }
        }
        async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<()> {
            self.record(format!("stop {name}"));
            Ok(())
        }
        async fn remove_container(&self, name: &str) -> Result<()> {
            self.record(format!("rm {name}"));
            Err(HangarError::Container("daemon hiccup".into()))
        }
    }

    fn plan(ttl: Duration) -> RunPlan {
        let id = Uuid::new_v4();
        RunPlan {
            workload_id: id,
            build: BuildSpec {
                tag: format!("hangar-workload:{id}"),
                definition: PathBuf::from("/tmp/Containerfile"),
                context: PathBuf::from("/tmp/src"),
            },
            run: RunSpec {
                name: format!("hangar-{id}"),
                image: format!("hangar-workload:{id}"),
                env: BTreeMap::new(),
                env_file: None,
                mounts: Vec::new(),
                limits: Limits::new(1, 1 << 29),
                network: "bridge".into(),
            },
            exec: workload_exec("main.wasm", BTreeMap::new()),
            ttl,
        }
    }

    fn protocol(runtime: Arc<ScriptedRuntime>) -> ExecProtocol {
        ExecProtocol::new(
            runtime,
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    fn stopped(code: i64) -> Result<ExecState> {
        Ok(ExecState {
            running: false,
            exit_code: Some(code),
        })
    }

    async fn capture(dir: &tempfile::TempDir) -> (PathBuf, Streams) {
        let log = dir.path().join("logs.txt");
        let streams = Streams::capture(&log).await.unwrap();
        (log, streams)
    }

    #[test]
    fn runtime_command_points_at_module() {
        let cmd = runtime_command("main.wasm");
        assert_eq!(cmd[0], CONTAINER_RUNTIME_PATH);
        assert_eq!(&cmd[1..4], &["run", "--module", "main.wasm"]);
        assert!(cmd.contains(&CONTAINER_WORKDIR.to_string()));
    }

    #[tokio::test]
    async fn successful_run_captures_output_and_cleans_up() {
        let mut output = encode_frame(StreamTag::Stdout, b"hello\n");
        output.extend(encode_frame(StreamTag::Stderr, b"oops\n"));
        let runtime = Arc::new(ScriptedRuntime::new(output, vec![stopped(0)]));
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(60));
        let tmp = tempfile::tempdir().unwrap();
        let (log, streams) = capture(&tmp).await;

        proto.prepare(&plan).await.unwrap();
        proto
            .execute(&plan, streams, &GracefulShutdown::new())
            .await
            .unwrap();

        let logs = std::fs::read_to_string(log).unwrap();
        assert!(logs.contains("hello"));
        assert!(logs.contains("oops"));

        let calls = runtime.calls();
        let name = plan.container();
        assert_eq!(calls[0], format!("build {}", plan.build.tag));
        assert_eq!(calls[1], format!("run {name} CI=true"));
        assert!(calls.contains(&format!("stop {name}")));
        assert!(calls.contains(&format!("rm {name}")));
    }

    #[tokio::test]
    async fn terminal_session_copies_raw_bytes_and_sizes_the_tty() {
        // Looks like a frame, but a TTY stream is never demultiplexed.
        let output = encode_frame(StreamTag::Stderr, b"prompt$ ");
        let runtime = Arc::new(ScriptedRuntime::new(output.clone(), vec![stopped(0)]));
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(60));
        let (stdout, mut seen) = tokio::io::duplex(1024);

        let streams = Streams {
            stdin: Some(Box::new(&b"ls\n"[..])),
            stdout: Box::new(stdout),
            stderr: Box::new(tokio::io::sink()),
            terminal: true,
            terminal_options: TerminalOptions {
                raw_mode: false,
                size: Some((24, 80)),
            },
        };
        proto
            .execute(&plan, streams, &GracefulShutdown::new())
            .await
            .unwrap();

        let mut copied = Vec::new();
        seen.read_to_end(&mut copied).await.unwrap();
        assert_eq!(copied, output);

        let calls = runtime.calls();
        let name = plan.container();
        assert!(calls.contains(&format!("exec {name} tty=true stdin=true")));
        assert!(calls.contains(&"start exec-1 tty=true".to_string()));
        let start = calls.iter().position(|c| c == "start exec-1 tty=true").unwrap();
        let resize = calls.iter().position(|c| c == "resize exec-1 24x80").unwrap();
        assert!(start < resize);
    }

    #[tokio::test]
    async fn captured_streams_use_multiplexed_exec() {
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new(), vec![stopped(0)]));
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(60));
        let tmp = tempfile::tempdir().unwrap();
        let (_, streams) = capture(&tmp).await;

        proto
            .execute(&plan, streams, &GracefulShutdown::new())
            .await
            .unwrap();

        let calls = runtime.calls();
        assert!(calls.contains(&"start exec-1 tty=false".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("resize")));
    }

    #[tokio::test]
    async fn nonzero_exit_is_workload_failure() {
        let runtime = Arc::new(ScriptedRuntime::new(
            Vec::new(),
            vec![
                Ok(ExecState {
                    running: true,
                    exit_code: None,
                }),
                stopped(2),
            ],
        ));
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(60));
        let tmp = tempfile::tempdir().unwrap();
        let (_, streams) = capture(&tmp).await;

        let err = proto
            .execute(&plan, streams, &GracefulShutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::Workload { exit_code: 2 }));
        assert!(runtime.calls().contains(&format!("stop {}", plan.container())));
    }

    #[tokio::test]
    async fn vanished_exec_counts_as_finished() {
        let runtime = Arc::new(ScriptedRuntime::new(
            Vec::new(),
            vec![Err(HangarError::NotFound("exec-1".into()))],
        ));
        let proto = protocol(runtime);
        let tmp = tempfile::tempdir().unwrap();
        let (_, streams) = capture(&tmp).await;

        proto
            .execute(&plan(Duration::from_secs(60)), streams, &GracefulShutdown::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn system_frame_fails_the_run() {
        let output = encode_frame(StreamTag::System, b"OCI runtime exec failed");
        let runtime = Arc::new(ScriptedRuntime::new(output, vec![stopped(0)]));
        let proto = protocol(runtime);
        let tmp = tempfile::tempdir().unwrap();
        let (_, streams) = capture(&tmp).await;

        let err = proto
            .execute(&plan(Duration::from_secs(60)), streams, &GracefulShutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::Protocol(m) if m.contains("OCI runtime")));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_times_out_but_still_cleans_up() {
        // Never stops running.
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new(), Vec::new()));
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(3));
        let tmp = tempfile::tempdir().unwrap();
        let (_, streams) = capture(&tmp).await;

        let err = proto
            .execute(&plan, streams, &GracefulShutdown::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::Timeout(_)));
        assert!(runtime.calls().contains(&format!("rm {}", plan.container())));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_deadline_cancels_poll_and_cleanup_still_runs() {
        let runtime = Arc::new(ScriptedRuntime::new(Vec::new(), Vec::new()));
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(3600));
        let tmp = tempfile::tempdir().unwrap();
        let (_, streams) = capture(&tmp).await;
        let shutdown = GracefulShutdown::with_deadline(Duration::from_secs(2));

        let err = proto.execute(&plan, streams, &shutdown).await.unwrap_err();
        assert_eq!(err.stop_cause(), Some(StopCause::DeadlineExceeded));
        assert!(runtime.calls().contains(&format!("stop {}", plan.container())));
    }

    #[tokio::test]
    async fn failed_start_is_cleaned_up() {
        let mut runtime = ScriptedRuntime::new(Vec::new(), Vec::new());
        runtime.fail_run = true;
        let runtime = Arc::new(runtime);
        let proto = protocol(runtime.clone());
        let plan = plan(Duration::from_secs(60));

        assert!(proto.prepare(&plan).await.is_err());
        assert!(runtime.calls().contains(&format!("rm {}", plan.container())));
    }
}
