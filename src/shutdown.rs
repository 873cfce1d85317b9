use futures::future;
use tokio::select;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Resolves once SIGINT or SIGTERM is received. Clones observe the same signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<Option<&'static str>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            rx: spawn_shutdown_listener(),
        }
    }

    #[cfg(test)]
    pub(crate) fn manual() -> (watch::Sender<Option<&'static str>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    pub async fn wait(&mut self) {
        if self.rx.wait_for(Option::is_some).await.is_err() {
            // Listener gone without a signal: never resolve.
            future::pending::<()>().await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_shutdown_listener() -> watch::Receiver<Option<&'static str>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).ok();

        let term_future = async {
            if let Some(ref mut sigterm) = sigterm {
                sigterm.recv().await;
                Some("SIGTERM")
            } else {
                future::pending::<Option<&'static str>>().await
            }
        };

        select! {
            res = signal::ctrl_c() => {
                if res.is_ok() {
                    info!("Received SIGINT. Shutting down...");
                    let _ = shutdown_tx.send(Some("SIGINT"));
                } else {
                    warn!("Failed to listen for SIGINT: {:?}", res.err());
                }
            }
            _ = term_future => {
                info!("Received SIGTERM. Shutting down...");
                let _ = shutdown_tx.send(Some("SIGTERM"));
            }
        }
        // Keep the sender alive so waiters see the value rather than a closed channel.
        shutdown_tx.closed().await;
    });

    shutdown_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_for_every_clone() {
        let (tx, shutdown) = Shutdown::manual();
        let mut a = shutdown.clone();
        let mut b = shutdown;
        assert!(a.rx.borrow().is_none());

        tx.send(Some("SIGTERM")).unwrap();

        a.wait().await;
        b.wait().await;
        assert_eq!(*b.rx.borrow(), Some("SIGTERM"));
    }
}
