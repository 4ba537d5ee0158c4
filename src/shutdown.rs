//! Termination signals turned into a cooperative shutdown message.
use tokio::sync::watch;
use tracing::warn;

/// Sends the shutdown message. Dropping it without triggering never stops the receivers.
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

/// Receiving side, checked by ingesters between discrete steps.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (ShutdownCoordinator { sender }, ShutdownSignal { receiver })
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Waits for SIGINT or SIGTERM, then triggers the shutdown.
    pub async fn listen(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        warn!("termination signal received, finishing current batch");
        self.trigger();
        Ok(())
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is triggered.
    pub async fn triggered(&mut self) {
        if self.receiver.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
