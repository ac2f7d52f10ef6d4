use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::watch;

/// Creates a linked stop trigger and listener.
pub fn channel() -> (Trigger, Shutdown) {
    let (sender, receiver) = watch::channel(false);
    (Trigger(Arc::new(sender)), Shutdown(receiver))
}

/// Fires the stop signal. Cloneable, so the supervised loop can stop its own tasks on a fatal error.
#[derive(Debug, Clone)]
pub struct Trigger(Arc<watch::Sender<bool>>);

impl Trigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown(self.0.subscribe())
    }
}

/// Listens for the stop signal. Every suspension point of the notary selects on this.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once stop is signalled, or once every trigger has been dropped.
    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }

    /// Runs `future` to completion unless stop is signalled first, in which case it is dropped and `None` returned.
    pub async fn until<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.triggered() => None,
            output = future => Some(output),
        }
    }

    /// Sleeps for `duration`. Returns `false` if stop was signalled before the sleep finished.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        self.until(tokio::time::sleep(duration)).await.is_some()
    }
}
