use core::future::Future;
use std::{collections::HashMap, thread::JoinHandle};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::Instant,
};

use crate::{
    cfg::{Config, ConfigTable, RespawnPolicy},
    engine::{Job, Launch, Outcome, ThreadLauncher, WorkerContext, WorkerExit, WorkerPid},
    error::TerminationError,
    shutdown::Shutdown,
    stat::Report,
};

/// Registry entry of a running worker.
#[derive(Debug)]
struct Slot {
    /// Configured identity.
    id: u64,
    thread: Option<JoinHandle<()>>,
    /// Forced termination trigger.
    kill: Option<oneshot::Sender<()>>,
}

/// Worker fleet orchestrator.
///
/// Starts one isolated worker per identity, reaps their exit notifications,
/// optionally respawns them and stops the whole fleet on request: first
/// cooperatively, then by force once the grace window has passed.
#[derive(Debug)]
pub struct Runtime<L = ThreadLauncher> {
    table: ConfigTable,
    respawn: RespawnPolicy,
    launcher: L,
    shutdown: Shutdown,
    /// Live workers.
    registry: HashMap<WorkerPid, Slot>,
    next_pid: u64,
    exit_tx: UnboundedSender<WorkerExit>,
    exit_rx: UnboundedReceiver<WorkerExit>,
    report: Report,
}

impl Runtime {
    pub fn new(cfg: Config) -> Self {
        Self::with_launcher(cfg, ThreadLauncher)
    }
}

impl<L: Launch> Runtime<L> {
    pub fn with_launcher(cfg: Config, launcher: L) -> Self {
        let Config { table, respawn, grace, .. } = cfg;
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        Self {
            table,
            respawn,
            launcher,
            shutdown: Shutdown::new(grace),
            registry: HashMap::new(),
            next_pid: 1,
            exit_tx,
            exit_rx,
            report: Report::default(),
        }
    }

    /// Runs the fleet until every worker has exited on its own, or until
    /// `stop` completes and the fleet has been terminated.
    pub async fn run<F>(mut self, stop: F) -> Report
    where
        F: Future<Output = ()>,
    {
        self.spawn_all();
        tokio::pin!(stop);

        while !self.registry.is_empty() {
            tokio::select! {
                exit = self.exit_rx.recv() => match exit {
                    Some(exit) => self.on_exit(exit),
                    None => break,
                },
                () = &mut stop => self.terminate().await,
            }
        }

        log::info!("all workers exited");
        self.report
    }

    /// Starts a worker for every configured identity.
    ///
    /// Identities that fail to start are reported and skipped.
    fn spawn_all(&mut self) {
        for id in self.table.identities() {
            self.spawn(id);
        }

        log::info!(
            "started {} out of {} workers",
            self.registry.len(),
            self.table.processes()
        );
        if self.report.is_degraded() {
            log::warn!("running degraded: {} workers failed to start", self.report.spawn_failures);
        }
    }

    fn spawn(&mut self, id: u64) {
        let cfg = match self.table.resolve(id) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::error!("{err}");
                self.report.spawn_failures += 1;
                return;
            }
        };
        let ctx = match WorkerContext::new(cfg) {
            Ok(ctx) => ctx,
            Err(err) => {
                log::error!("{err}");
                self.report.spawn_failures += 1;
                return;
            }
        };

        let pid = WorkerPid::new(self.next_pid);
        self.next_pid += 1;

        let (kill_tx, kill_rx) = oneshot::channel();
        let job = Job {
            pid,
            ctx,
            stop: self.shutdown.token(),
            kill: kill_rx,
            exit: self.exit_tx.clone(),
        };

        match self.launcher.launch(job) {
            Ok(thread) => {
                log::debug!("worker {id} started as {pid}");
                let slot = Slot { id, thread: Some(thread), kill: Some(kill_tx) };
                self.registry.insert(pid, slot);
                self.report.spawned += 1;
            }
            Err(err) => {
                log::error!("{err}");
                self.report.spawn_failures += 1;
            }
        }
    }

    fn on_exit(&mut self, exit: WorkerExit) {
        let WorkerExit { pid, id, outcome, stats } = exit;

        let Some(mut slot) = self.registry.remove(&pid) else {
            log::warn!("exit notification from unknown worker {id} ({pid})");
            return;
        };
        // The exit is reported last, but the thread may still be unwinding.
        // Never block the orchestrator on it, detach instead.
        if let Some(thread) = slot.thread.take().filter(JoinHandle::is_finished) {
            if thread.join().is_err() {
                log::error!("worker {id} ({pid}) thread panicked after reporting");
            }
        }

        match outcome {
            Outcome::Completed | Outcome::Stopped => log::debug!("worker {id} ({pid}): {outcome:?}"),
            Outcome::GaveUp | Outcome::Killed => log::warn!("worker {id} ({pid}): {outcome:?}"),
            Outcome::Crashed => log::error!("worker {id} ({pid}): {outcome:?}"),
        }
        self.report.on_exit(outcome, &stats);

        if self.should_respawn(outcome) {
            log::info!("respawning worker {id}");
            self.report.respawned += 1;
            self.spawn(id);
        }
    }

    fn should_respawn(&self, outcome: Outcome) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }

        match self.respawn {
            RespawnPolicy::Never => false,
            RespawnPolicy::OnFailure => matches!(outcome, Outcome::GaveUp | Outcome::Crashed),
            RespawnPolicy::Always => true,
        }
    }

    /// Stops every live worker, leaving the registry empty.
    ///
    /// Raises the stop flag and waits for exits until the grace window
    /// passes. Survivors are then killed and waited for once more. Workers
    /// that do not acknowledge even that are reported and abandoned.
    async fn terminate(&mut self) {
        log::info!("stopping {} workers ...", self.registry.len());
        self.shutdown.trigger();
        self.reap_until(self.shutdown.grace_deadline()).await;

        if self.registry.is_empty() {
            return;
        }

        log::warn!(
            "{} workers did not stop within the grace window, killing",
            self.registry.len()
        );
        for slot in self.registry.values_mut() {
            if let Some(kill) = slot.kill.take() {
                _ = kill.send(());
            }
        }
        self.reap_until(self.shutdown.kill_deadline()).await;

        for (pid, slot) in self.registry.drain() {
            log::error!("{}", TerminationError { pid, id: slot.id });
            self.report.unreaped += 1;
        }
    }

    async fn reap_until(&mut self, deadline: Instant) {
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, self.exit_rx.recv()).await {
                Ok(Some(exit)) => self.on_exit(exit),
                Ok(None) | Err(..) => break,
            }
        }
    }
}
