use std::{
    panic::{self, AssertUnwindSafe},
    thread::{Builder, JoinHandle},
};

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use super::{Job, Launch, Outcome, ProbeWorker, WorkerContext, WorkerExit, WorkerPid};
use crate::{error::SpawnError, shutdown::StopToken, stat::WorkerStats};

/// Runs each worker on a dedicated thread with its own single-threaded
/// runtime.
///
/// Nothing but the exit notification crosses the thread boundary, so a
/// worker that panics takes down its thread only.
#[derive(Debug, Default)]
pub struct ThreadLauncher;

impl Launch for ThreadLauncher {
    fn launch(&mut self, job: Job) -> Result<JoinHandle<()>, SpawnError> {
        let id = job.ctx.id();
        let name = format!("onslaught:{id:02}");

        match Builder::new().name(name).spawn(move || run(job)) {
            Ok(thread) => Ok(thread),
            Err(source) => Err(SpawnError::Thread { id, source }),
        }
    }
}

/// Worker thread body.
fn run(job: Job) {
    let Job { pid, ctx, stop, kill, exit } = job;
    let id = ctx.id();

    contain(pid, id, exit, move || execute(ctx, stop, kill));
}

/// Runs the worker body, turning a panic into a crash exit.
///
/// Reports exactly one exit, unless the orchestrator is already gone. A crash
/// exit carries empty stats, since the worker's own are lost with it.
fn contain<F>(pid: WorkerPid, id: u64, exit: UnboundedSender<WorkerExit>, f: F)
where
    F: FnOnce() -> (Outcome, WorkerStats),
{
    let (outcome, stats) = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(..) => {
            log::error!("worker {id} ({pid}) crashed");
            (Outcome::Crashed, WorkerStats::default())
        }
    };

    if exit.send(WorkerExit { pid, id, outcome, stats }).is_err() {
        log::warn!("worker {id} ({pid}) exited after the orchestrator");
    }
}

fn execute(ctx: WorkerContext, stop: StopToken, kill: oneshot::Receiver<()>) -> (Outcome, WorkerStats) {
    let id = ctx.id();
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            log::error!("worker {id}: failed to create runtime: {err}");
            return (Outcome::Crashed, WorkerStats::default());
        }
    };

    let mut worker = ProbeWorker::new(ctx, stop);
    let outcome = rt.block_on(async {
        tokio::select! {
            outcome = worker.run() => outcome,
            _ = kill => Outcome::Killed,
        }
    });
    if outcome == Outcome::Killed {
        log::debug!("worker {id}: killed in {:?} state", worker.state());
    }

    // The connection driver lives on this runtime.
    let stats = rt.block_on(async move { worker.finish() });

    (outcome, stats)
}

#[cfg(test)]
mod test {
    use core::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        shutdown::Shutdown,
        testing::{self, TestServer},
    };

    #[test]
    fn panic_becomes_crash() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        contain(WorkerPid::new(1), 4, tx, || panic!("boom"));

        let exit = rx.try_recv().unwrap();
        assert_eq!(WorkerPid::new(1), exit.pid);
        assert_eq!(4, exit.id);
        assert_eq!(Outcome::Crashed, exit.outcome);
        assert_eq!(WorkerStats::default(), exit.stats);
    }

    #[test]
    fn kill_interrupts_in_flight_request() {
        let server = TestServer::start(|_| None);
        let shutdown = Shutdown::new(Duration::ZERO);
        let ctx = WorkerContext::new(testing::worker_config(&[&server.url("/"), "-m", "60000"])).unwrap();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let job = Job {
            pid: WorkerPid::new(9),
            ctx,
            stop: shutdown.token(),
            kill: kill_rx,
            exit: tx,
        };
        let thread = ThreadLauncher.launch(job).unwrap();

        while server.requests().is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
        kill_tx.send(()).unwrap();
        thread.join().unwrap();

        let exit = rx.try_recv().unwrap();
        assert_eq!(Outcome::Killed, exit.outcome);
        assert_eq!(0, exit.stats.requests_sent);
    }

    #[test]
    fn thread_reports_completion() {
        let server = TestServer::start(|_| Some(testing::response(200, &[])));
        let shutdown = Shutdown::new(Duration::ZERO);
        let ctx = WorkerContext::new(testing::worker_config(&[&server.url("/"), "-n", "5"])).unwrap();
        let (_kill_tx, kill_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let job = Job {
            pid: WorkerPid::new(1),
            ctx,
            stop: shutdown.token(),
            kill: kill_rx,
            exit: tx,
        };
        ThreadLauncher.launch(job).unwrap().join().unwrap();

        let exit = rx.try_recv().unwrap();
        assert_eq!(Outcome::Completed, exit.outcome);
        assert_eq!(5, exit.stats.requests_sent);
    }
}
