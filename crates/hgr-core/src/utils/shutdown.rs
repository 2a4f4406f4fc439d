use std::time::Duration;

use hgr_types::{HangarError, Result, StopCause};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Top-level cancellation for the scheduler loop.
///
/// Combines an explicit cancellation token (signals, reload requests) with an
/// optional deadline. The first recorded cause wins.
pub struct GracefulShutdown {
    token: CancellationToken,
    cause: Mutex<Option<StopCause>>,
    deadline: Option<Instant>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Mutex::new(None),
            deadline: None,
        }
    }

    /// A shutdown controller that also fires once `timeout` has elapsed.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::new()
        }
    }

    /// Why the loop must stop, if it must.
    pub fn cause(&self) -> Option<StopCause> {
        if let Some(cause) = *self.cause.lock() {
            return Some(cause);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Err(Cancelled)` once the loop must stop.
    pub fn check(&self) -> Result<()> {
        match self.cause() {
            Some(cause) => Err(HangarError::Cancelled(cause)),
            None => Ok(()),
        }
    }

    /// Request shutdown with the given cause.
    pub fn request(&self, cause: StopCause) {
        {
            let mut guard = self.cause.lock();
            if guard.is_some() {
                return;
            }
            *guard = Some(cause);
        }
        info!(%cause, "Stop requested");
        self.token.cancel();
    }

    pub fn request_shutdown(&self) {
        self.request(StopCause::Shutdown);
    }

    pub fn request_reload(&self) {
        self.request(StopCause::Reload);
    }

    /// Resolves once the loop must stop, yielding the cause.
    pub async fn cancelled(&self) -> StopCause {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
        self.cause().unwrap_or(StopCause::Shutdown)
    }

    /// Sleep for `duration`, or fail early with the stop cause.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            cause = self.cancelled() => Err(HangarError::Cancelled(cause)),
        }
    }

    /// Install signal handlers. SIGINT/SIGTERM request shutdown, SIGHUP a reload.
    pub async fn wait_for_signal(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sighup = signal(SignalKind::hangup())?;
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    self.request_shutdown();
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    self.request_shutdown();
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP");
                    self.request_reload();
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C");
            self.request_shutdown();
        }
        Ok(())
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_initially_not_shutting_down() {
        let gs = GracefulShutdown::new();
        assert_eq!(gs.cause(), None);
        assert!(gs.check().is_ok());
    }

    #[tokio::test]
    async fn shutdown_request_sets_cause() {
        let gs = GracefulShutdown::new();
        gs.request_reload();
        assert_eq!(gs.cause(), Some(StopCause::Reload));
        assert_eq!(gs.cancelled().await, StopCause::Reload);
    }

    #[tokio::test]
    async fn first_cause_wins() {
        let gs = GracefulShutdown::new();
        gs.request_shutdown();
        gs.request_reload();
        assert_eq!(gs.cause(), Some(StopCause::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires() {
        let gs = GracefulShutdown::with_deadline(Duration::from_secs(5));
        assert_eq!(gs.cause(), None);
        assert_eq!(gs.cancelled().await, StopCause::DeadlineExceeded);
        assert!(matches!(
            gs.check(),
            Err(HangarError::Cancelled(StopCause::DeadlineExceeded))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short() {
        let gs = GracefulShutdown::with_deadline(Duration::from_secs(1));
        let err = gs.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.stop_cause(), Some(StopCause::DeadlineExceeded));

        let gs = GracefulShutdown::new();
        assert!(gs.sleep(Duration::from_millis(10)).await.is_ok());
    }
}
