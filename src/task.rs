use std::any::Any;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned task paired with the token that asks it to exit.
pub(crate) struct CancellableTask<T> {
    join_handle: JoinHandle<T>,
    token: CancellationToken,
}

impl<T: Send + 'static> CancellableTask<T> {
    /// Spawns `run` with a fresh token.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        Self::spawn_with(CancellationToken::new(), run)
    }

    pub(crate) fn spawn_with<F, Fut>(token: CancellationToken, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let join_handle = tokio::spawn(run(token.clone()));
        Self { join_handle, token }
    }
}

impl<T> CancellableTask<T> {
    /// Asks the task to exit without waiting for it. Repeated calls are no-ops.
    pub(crate) fn signal(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Waits for the task to exit.
    ///
    /// Returns `None` if the task was aborted or panicked; a panic is logged, not resumed.
    pub(crate) async fn join(self) -> Option<T> {
        match self.join_handle.await {
            Ok(output) => Some(output),
            Err(err) if err.is_panic() => {
                log::error!("Background task panicked: {}", panic_message(&*err.into_panic()));
                None
            }
            Err(_) => None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
