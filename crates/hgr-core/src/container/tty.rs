//! Interactive attach: raw local terminal, plain byte copy, resize forwarding.

use crossterm::terminal;
use hgr_types::{HangarError, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::runtime::{ContainerRuntime, ExecStream};

/// Puts the local terminal in raw mode until dropped.
pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| HangarError::Other(format!("Failed to enable raw mode: {e}")))?;
        Ok(Self(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Current local terminal size as `(height, width)`.
pub fn terminal_size() -> Option<(u16, u16)> {
    terminal::size().ok().map(|(cols, rows)| (rows, cols))
}

/// How the local side of a TTY session behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalOptions {
    /// Switch the process's terminal to raw mode and follow its window
    /// size changes.
    pub raw_mode: bool,
    /// Initial `(height, width)`. Falls back to the local terminal's size
    /// in raw mode.
    pub size: Option<(u16, u16)>,
}

/// Copy bytes both ways until the session's output reaches EOF, forwarding
/// local window size changes to the exec session in the meantime.
pub async fn run_session<I, O>(
    runtime: &dyn ContainerRuntime,
    exec_id: &str,
    stream: ExecStream,
    stdin: Option<I>,
    stdout: &mut O,
    options: TerminalOptions,
) -> Result<()>
where
    I: AsyncRead + Unpin + Send,
    O: AsyncWrite + Unpin + Send + ?Sized,
{
    let _raw = if options.raw_mode {
        Some(RawModeGuard::enable()?)
    } else {
        None
    };
    let size = match options.size {
        Some(size) => Some(size),
        None if options.raw_mode => terminal_size(),
        None => None,
    };
    if let Some((h, w)) = size {
        resize(runtime, exec_id, h, w).await;
    }

    let (mut rd, mut wr) = tokio::io::split(stream);

    let output = async {
        tokio::io::copy(&mut rd, stdout).await?;
        stdout.flush().await?;
        Ok::<_, HangarError>(())
    };
    let input = async {
        if let Some(mut stdin) = stdin {
            tokio::io::copy(&mut stdin, &mut wr).await?;
        }
        wr.shutdown().await?;
        Ok::<_, HangarError>(())
    };
    let resizes = async {
        if options.raw_mode {
            forward_resizes(runtime, exec_id).await;
        }
        std::future::pending::<()>().await
    };

    tokio::pin!(output, input, resizes);
    let mut input_done = false;
    loop {
        tokio::select! {
            res = &mut output => return res,
            res = &mut input, if !input_done => {
                input_done = true;
                if let Err(e) = res {
                    debug!(exec_id, error = %e, "Terminal input closed");
                }
            }
            _ = &mut resizes => {}
        }
    }
}

async fn resize(runtime: &dyn ContainerRuntime, exec_id: &str, height: u16, width: u16) {
    if let Err(e) = runtime.resize_exec(exec_id, height, width).await {
        debug!(exec_id, error = %e, "Exec resize failed");
    }
}

#[cfg(unix)]
async fn forward_resizes(runtime: &dyn ContainerRuntime, exec_id: &str) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot watch terminal size");
            return std::future::pending().await;
        }
    };
    while winch.recv().await.is_some() {
        if let Some((h, w)) = terminal_size() {
            resize(runtime, exec_id, h, w).await;
        }
    }
    std::future::pending().await
}

#[cfg(not(unix))]
async fn forward_resizes(_runtime: &dyn ContainerRuntime, _exec_id: &str) {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::container::runtime::{BuildSpec, ExecSpec, ExecState, RunSpec};

    /// Only resizes are expected during a session.
    #[derive(Default)]
    struct Resizes(Mutex<Vec<(String, u16, u16)>>);

    #[async_trait]
    impl ContainerRuntime for Resizes {
        async fn image_exists(&self, _tag: &str) -> Result<bool> {
            unreachable!()
        }
        async fn build_image(&self, _spec: &BuildSpec) -> Result<()> {
            unreachable!()
        }
        async fn remove_image(&self, _tag: &str) -> Result<()> {
            unreachable!()
        }
        async fn run_detached(&self, _spec: &RunSpec) -> Result<()> {
            unreachable!()
        }
        async fn create_exec(&self, _container: &str, _spec: &ExecSpec) -> Result<String> {
            unreachable!()
        }
        async fn start_exec(&self, _exec_id: &str, _tty: bool) -> Result<ExecStream> {
            unreachable!()
        }
        async fn resize_exec(&self, exec_id: &str, height: u16, width: u16) -> Result<()> {
            self.0.lock().push((exec_id.to_string(), height, width));
            Ok(())
        }
        async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecState> {
            unreachable!()
        }
        async fn stop_container(&self, _name: &str, _timeout: Duration) -> Result<()> {
            unreachable!()
        }
        async fn remove_container(&self, _name: &str) -> Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn session_echoes_input_back_through_the_tty() {
        let runtime = Resizes::default();
        let (client, mut server) = tokio::io::duplex(256);

        // The remote end echoes one line, then hangs up.
        let remote = tokio::spawn(async move {
            let mut line = [0u8; 3];
            server.read_exact(&mut line).await.unwrap();
            server.write_all(b"$ ").await.unwrap();
            server.write_all(&line).await.unwrap();
        });

        let mut stdout = Vec::new();
        run_session(
            &runtime,
            "exec-7",
            Box::new(client),
            Some(&b"ls\n"[..]),
            &mut stdout,
            TerminalOptions {
                raw_mode: false,
                size: Some((40, 120)),
            },
        )
        .await
        .unwrap();
        remote.await.unwrap();

        assert_eq!(stdout, b"$ ls\n");
        assert_eq!(*runtime.0.lock(), vec![("exec-7".to_string(), 40, 120)]);
    }

    #[tokio::test]
    async fn no_size_no_resize() {
        let runtime = Resizes::default();
        let (client, server) = tokio::io::duplex(16);
        drop(server);

        let mut stdout = Vec::new();
        run_session(
            &runtime,
            "exec-8",
            Box::new(client),
            None::<&[u8]>,
            &mut stdout,
            TerminalOptions::default(),
        )
        .await
        .unwrap();

        assert!(stdout.is_empty());
        assert!(runtime.0.lock().is_empty());
    }
}
