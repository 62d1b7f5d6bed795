// ── Listener lifecycle ──
//
// One small state machine per background task: idle or running. Start
// is idempotent, stop cancels and waits (bounded) for the task to
// unwind, then leaves the slot idle so the task can be started again.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ListenerTask {
    name: String,
    stop_timeout: Duration,
    state: Mutex<Option<Running>>,
}

impl ListenerTask {
    pub fn new(name: impl Into<String>, stop_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            stop_timeout,
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the task built by `make` under a child of `parent`.
    ///
    /// Returns `false` (and drops `make` unused) when the task is
    /// already running. A task that ended on its own counts as stopped.
    pub async fn start<F, Fut>(&self, parent: &CancellationToken, make: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(make(cancel.clone()));
        *state = Some(Running { cancel, handle });
        debug!(task = %self.name, "started");
        true
    }

    /// Cancel the task and wait for it to finish.
    ///
    /// Returns `false` when nothing was running. A task that does not
    /// unwind within the stop timeout is aborted.
    pub async fn stop(&self) -> bool {
        let Some(Running { cancel, mut handle }) = self.state.lock().await.take() else {
            return false;
        };

        cancel.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => debug!(task = %self.name, "stopped"),
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "task ended abnormally"),
            Err(_) => {
                warn!(
                    task = %self.name,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "task ignored cancellation, aborting"
                );
                handle.abort();
            }
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}
