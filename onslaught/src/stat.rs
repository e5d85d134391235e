use core::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use serde::Serialize;

use crate::{engine::Outcome, histogram::LogHistogram};

/// Per-worker counters.
///
/// Mutated only by the owning worker, read by the orchestrator once the
/// worker has exited.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Requests that received a final response.
    pub requests_sent: u64,
    /// Final responses with a status below 400.
    pub requests_succeeded: u64,
    /// Final responses with a status of 400 or above.
    pub requests_failed: u64,
    /// Requests abandoned after the per-request timeout.
    pub requests_timed_out: u64,
    /// Failed connection attempts, including timed out ones.
    pub connect_failures: u64,
    /// Requests that failed on an established connection.
    pub transport_errors: u64,
    /// Redirect responses that were followed.
    pub redirects_followed: u64,
    /// Accumulated latency of final responses, us.
    pub total_latency_us: u64,
    #[serde(skip)]
    pub latency: LogHistogram,
}

impl WorkerStats {
    #[inline]
    pub fn on_connect_failure(&mut self) {
        self.connect_failures += 1;
    }

    #[inline]
    pub fn on_timeout(&mut self) {
        self.requests_timed_out += 1;
    }

    #[inline]
    pub fn on_transport_error(&mut self) {
        self.transport_errors += 1;
    }

    #[inline]
    pub fn on_redirect(&mut self) {
        self.redirects_followed += 1;
    }

    /// Records a final response, classifying it by status.
    pub fn on_response(&mut self, status: u16, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;

        self.requests_sent += 1;
        self.total_latency_us += us;
        self.latency.record(us);

        if status < 400 {
            self.requests_succeeded += 1;
        } else {
            self.requests_failed += 1;
        }
    }

    /// Average latency of final responses.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.requests_sent == 0 {
            return None;
        }

        Some(Duration::from_micros(self.total_latency_us / self.requests_sent))
    }

    pub fn merge(&mut self, other: &Self) {
        self.requests_sent += other.requests_sent;
        self.requests_succeeded += other.requests_succeeded;
        self.requests_failed += other.requests_failed;
        self.requests_timed_out += other.requests_timed_out;
        self.connect_failures += other.connect_failures;
        self.transport_errors += other.transport_errors;
        self.redirects_followed += other.redirects_followed;
        self.total_latency_us += other.total_latency_us;
        self.latency.merge(&other.latency);
    }
}

/// Aggregate result of a run.
///
/// Counters of a crashed worker die with it, so crashed slots contribute
/// nothing to `stats`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Workers started, respawns included.
    pub spawned: u64,
    pub respawned: u64,
    /// Slots that could not be started.
    pub spawn_failures: u64,
    pub completed: u64,
    pub stopped: u64,
    pub gave_up: u64,
    pub crashed: u64,
    /// Workers terminated by force after the grace window.
    pub killed: u64,
    /// Workers that did not acknowledge forced termination.
    pub unreaped: u64,
    pub stats: WorkerStats,
}

impl Report {
    /// Accounts for a worker exit, merging its final counters.
    pub fn on_exit(&mut self, outcome: Outcome, stats: &WorkerStats) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Stopped => self.stopped += 1,
            Outcome::GaveUp => self.gave_up += 1,
            Outcome::Killed => self.killed += 1,
            Outcome::Crashed => self.crashed += 1,
        }

        self.stats.merge(stats);
    }

    /// Returns `true` if some slots never ran.
    #[inline]
    pub fn is_degraded(&self) -> bool {
        self.spawn_failures > 0
    }

    /// Returns `true` if some workers had to be terminated by force.
    #[inline]
    pub fn is_forced(&self) -> bool {
        self.killed + self.unreaped > 0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct View<'a> {
            #[serde(flatten)]
            report: &'a Report,
            degraded: bool,
            forced: bool,
            latency_avg_us: u64,
            latency_p50_us: u64,
            latency_p90_us: u64,
            latency_p99_us: u64,
        }

        let latency = &self.stats.latency;
        let view = View {
            report: self,
            degraded: self.is_degraded(),
            forced: self.is_forced(),
            latency_avg_us: self.stats.average_latency().unwrap_or_default().as_micros() as u64,
            latency_p50_us: latency.quantile(0.50),
            latency_p90_us: latency.quantile(0.90),
            latency_p99_us: latency.quantile(0.99),
        };

        serde_json::to_string_pretty(&view)
    }
}

impl Display for Report {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        let stats = &self.stats;
        let latency = &stats.latency;

        writeln!(
            fmt,
            "workers:   {} spawned, {} respawned, {} failed to spawn",
            self.spawned, self.respawned, self.spawn_failures
        )?;
        writeln!(
            fmt,
            "exits:     {} completed, {} stopped, {} gave up, {} crashed, {} killed, {} unreaped",
            self.completed, self.stopped, self.gave_up, self.crashed, self.killed, self.unreaped
        )?;
        writeln!(
            fmt,
            "requests:  {} sent, {} succeeded, {} failed, {} timed out",
            stats.requests_sent, stats.requests_succeeded, stats.requests_failed, stats.requests_timed_out
        )?;
        writeln!(
            fmt,
            "errors:    {} connect, {} transport; {} redirects followed",
            stats.connect_failures, stats.transport_errors, stats.redirects_followed
        )?;
        match stats.average_latency() {
            Some(avg) => writeln!(
                fmt,
                "latency:   avg {:.3}ms, p50 {:.3}ms, p90 {:.3}ms, p99 {:.3}ms",
                avg.as_secs_f64() * 1e3,
                latency.quantile(0.50) as f64 / 1e3,
                latency.quantile(0.90) as f64 / 1e3,
                latency.quantile(0.99) as f64 / 1e3,
            )?,
            None => writeln!(fmt, "latency:   n/a")?,
        }
        if self.is_degraded() {
            writeln!(fmt, "run was degraded: not all workers could be started")?;
        }
        if self.is_forced() {
            writeln!(fmt, "run was forced: some workers had to be killed")?;
        }

        Ok(())
    }
}
