use core::{future, time::Duration};

#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::{sync::watch, time::Instant};

/// How long force-terminated workers have to acknowledge.
pub const KILL_WINDOW: Duration = Duration::from_secs(1);

/// Owner of the run-wide stop flag.
///
/// Workers observe the flag through [`StopToken`]s and act on it only at
/// their checkpoint, between iterations.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, grace }
    }

    #[inline]
    pub fn token(&self) -> StopToken {
        StopToken { rx: self.tx.subscribe() }
    }

    /// Raises the stop flag. Idempotent.
    #[inline]
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Deadline for cooperative termination, starting now.
    #[inline]
    pub fn grace_deadline(&self) -> Instant {
        Instant::now() + self.grace
    }

    /// Deadline for acknowledging forced termination, starting now.
    #[inline]
    pub fn kill_deadline(&self) -> Instant {
        Instant::now() + KILL_WINDOW
    }
}

/// Worker side of the stop flag.
///
/// A token whose [`Shutdown`] is gone reads as stopped.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    #[inline]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Completes once the flag is raised.
    pub async fn stopped(&mut self) {
        _ = self.rx.wait_for(|&v| v).await;
    }
}

/// Completes on the first SIGINT or SIGTERM.
pub async fn signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for SIGINT: {err}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let mut term = match unix_signal(SignalKind::terminate()) {
            Ok(term) => Some(term),
            Err(err) => {
                log::error!("failed to register SIGTERM handler: {err}");
                None
            }
        };

        tokio::select! {
            () = ctrl_c => log::info!("caught SIGINT"),
            () = async {
                match term.as_mut() {
                    Some(term) => {
                        term.recv().await;
                    }
                    None => future::pending::<()>().await,
                }
            } => log::info!("caught SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        log::info!("caught SIGINT");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_is_observed_by_every_token() {
        let shutdown = Shutdown::new(Duration::from_millis(10));
        let a = shutdown.token();
        let b = a.clone();

        assert!(!a.is_stopped());
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        shutdown.trigger();

        assert!(a.is_stopped());
        assert!(b.is_stopped());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn dropped_owner_reads_as_stopped() {
        let shutdown = Shutdown::new(Duration::ZERO);
        let token = shutdown.token();
        drop(shutdown);

        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn stopped_wakes_up() {
        let shutdown = Shutdown::new(Duration::ZERO);
        let mut token = shutdown.token();

        let wait = tokio::time::timeout(Duration::from_secs(5), token.stopped());
        let (res, ()) = tokio::join!(wait, async { shutdown.trigger() });

        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn deadlines() {
        let shutdown = Shutdown::new(Duration::from_secs(3));
        let now = Instant::now();

        assert!(shutdown.grace_deadline() >= now + Duration::from_secs(3));
        assert!(shutdown.kill_deadline() >= now + KILL_WINDOW);
    }
}
