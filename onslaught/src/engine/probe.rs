use std::time::Instant;

use super::{Connection, Outcome, Pacer, Response, WorkerContext};
use crate::{cfg::Target, shutdown::StopToken, stat::WorkerStats};

/// Maximum number of consecutive redirects followed before a 3xx response is
/// counted as final.
const MAX_REDIRECTS: u32 = 10;

/// Where the worker is within its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Sending,
    AwaitingResponse,
    Pacing,
    /// Left the loop, resources not yet released.
    Terminating,
    Terminated,
}

/// Result of a single loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Exit(Outcome),
}

/// Repeatedly requests the configured URL until told to stop.
///
/// Each iteration connects if needed, sends one request, waits for the
/// response, paces and then reaches the checkpoint. The stop flag is honored
/// at the checkpoint only, so an in-flight request is never abandoned because
/// of it.
#[derive(Debug)]
pub struct ProbeWorker {
    ctx: WorkerContext,
    /// Current target, differs from the configured URL while following
    /// redirects.
    target: Target,
    pacer: Pacer,
    stop: StopToken,
    state: State,
    /// Consecutive connection failures.
    connect_failures: u64,
    /// Consecutive redirects followed.
    redirects: u32,
}

impl ProbeWorker {
    pub fn new(ctx: WorkerContext, stop: StopToken) -> Self {
        let target = ctx.cfg.url.clone();
        let pacer = Pacer::new(ctx.cfg.pacing);

        Self {
            ctx,
            target,
            pacer,
            stop,
            state: State::Connecting,
            connect_failures: 0,
            redirects: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> &WorkerStats {
        &self.ctx.stats
    }

    /// Runs iterations until one of them decides to exit.
    pub async fn run(&mut self) -> Outcome {
        log::debug!("worker {}: probing {}", self.ctx.id(), self.target);

        loop {
            if let Step::Exit(outcome) = self.step().await {
                self.state = State::Terminating;
                log::debug!("worker {}: exiting with {outcome:?}", self.ctx.id());
                return outcome;
            }
        }
    }

    /// Performs a single iteration, ending at the checkpoint.
    pub async fn step(&mut self) -> Step {
        self.state = State::Connecting;

        if self.ctx.conn.as_ref().is_some_and(Connection::is_closed) {
            self.ctx.conn = None;
        }

        if self.ctx.conn.is_none() {
            match self.connect().await {
                Ok(conn) => {
                    self.ctx.conn = Some(conn);
                    self.connect_failures = 0;
                }
                Err(err) => {
                    log::debug!("worker {}: failed to connect to {}: {err}", self.ctx.id(), self.target);
                    self.ctx.stats.on_connect_failure();

                    if self.target != self.ctx.cfg.url {
                        // Only the configured URL counts towards giving up.
                        self.restart();
                    } else {
                        self.connect_failures += 1;
                        if let Some(limit) = self.ctx.cfg.max_connect_failures {
                            if self.connect_failures >= limit.get() {
                                log::warn!(
                                    "worker {}: giving up after {} consecutive connection failures",
                                    self.ctx.id(),
                                    self.connect_failures
                                );
                                return Step::Exit(Outcome::GaveUp);
                            }
                        }
                    }

                    self.pace().await;
                    return self.checkpoint();
                }
            }
        }

        self.probe().await;
        self.pace().await;
        self.checkpoint()
    }

    /// Releases the connection and returns the final counters.
    pub fn finish(mut self) -> WorkerStats {
        self.ctx.conn = None;
        self.state = State::Terminated;
        log::trace!("worker {}: {:?}", self.ctx.id(), self.state);

        self.ctx.stats
    }

    async fn connect(&self) -> Result<Connection, anyhow::Error> {
        let conn = tokio::time::timeout(self.ctx.cfg.max_time, Connection::open(&self.target)).await??;
        Ok(conn)
    }

    async fn probe(&mut self) {
        let request = match self.ctx.payload.request(&self.target) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("worker {}: failed to build request for {}: {err}", self.ctx.id(), self.target);
                self.ctx.stats.on_transport_error();
                self.restart();
                return;
            }
        };

        let Some(conn) = self.ctx.conn.as_mut() else {
            return;
        };

        let now = Instant::now();
        let state = &mut self.state;
        let result = tokio::time::timeout(self.ctx.cfg.max_time, async {
            *state = State::Sending;
            conn.ready().await?;
            *state = State::AwaitingResponse;
            conn.exchange(request).await
        })
        .await;

        match result {
            Ok(Ok(resp)) => self.on_response(resp, now),
            Ok(Err(err)) => {
                log::debug!("worker {}: request to {} failed: {err}", self.ctx.id(), self.target);
                self.ctx.stats.on_transport_error();
                self.ctx.conn = None;
                self.restart();
            }
            Err(..) => {
                log::debug!("worker {}: request to {} timed out", self.ctx.id(), self.target);
                self.ctx.stats.on_timeout();
                self.ctx.conn = None;
                self.restart();
            }
        }
    }

    fn on_response(&mut self, resp: Response, now: Instant) {
        let elapsed = now.elapsed();

        if resp.close {
            self.ctx.conn = None;
        }

        if self.ctx.cfg.follow_redirects && resp.status.is_redirection() {
            if let Some(target) = self.redirect_target(&resp) {
                log::trace!("worker {}: following redirect to {target}", self.ctx.id());
                self.ctx.stats.on_redirect();
                self.redirects += 1;
                self.retarget(target);
                return;
            }
        }

        self.ctx.stats.on_response(resp.status.as_u16(), elapsed);
        self.restart();
    }

    fn redirect_target(&self, resp: &Response) -> Option<Target> {
        if self.redirects >= MAX_REDIRECTS {
            log::debug!("worker {}: too many redirects, stopping at {}", self.ctx.id(), self.target);
            return None;
        }

        let location = resp.location.as_ref()?.to_str().ok()?;
        match self.target.join(location) {
            Ok(target) => Some(target),
            Err(err) => {
                log::debug!("worker {}: ignoring redirect: {err}", self.ctx.id());
                None
            }
        }
    }

    /// Goes back to the configured URL, forgetting any redirect chain.
    fn restart(&mut self) {
        self.redirects = 0;
        if self.target != self.ctx.cfg.url {
            self.retarget(self.ctx.cfg.url.clone());
        }
    }

    fn retarget(&mut self, target: Target) {
        if self.ctx.conn.as_ref().is_some_and(|conn| !conn.serves(&target)) {
            self.ctx.conn = None;
        }
        self.target = target;
    }

    async fn pace(&mut self) {
        self.state = State::Pacing;

        let delay = self.pacer.next_delay();
        if delay.is_zero() {
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = self.stop.stopped() => {}
        }
    }

    fn checkpoint(&self) -> Step {
        if self.stop.is_stopped() {
            return Step::Exit(Outcome::Stopped);
        }

        if let Some(limit) = self.ctx.cfg.requests {
            if self.ctx.stats.requests_sent >= limit.get() {
                return Step::Exit(Outcome::Completed);
            }
        }

        Step::Continue
    }
}
