use core::fmt::{self, Display, Formatter};
use std::thread::JoinHandle;

use bytes::Bytes;
use http::{header, HeaderMap, Method, Request};
use http_body_util::Empty;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

pub use self::{
    conn::{Connection, Response},
    pacing::Pacer,
    probe::{ProbeWorker, State, Step},
    runtime::ThreadLauncher,
};
use crate::{
    cfg::{Header, Target, WorkerConfig},
    error::SpawnError,
    shutdown::StopToken,
    stat::WorkerStats,
};

mod conn;
mod io;
mod pacing;
mod probe;
pub mod runtime;

/// Orchestrator-assigned identifier of a running worker.
///
/// Unlike the configured identity, it is never reused: a respawned slot gets
/// a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerPid(u64);

impl WorkerPid {
    #[inline]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }
}

impl Display for WorkerPid {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        write!(fmt, "pid {}", self.0)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reached its request limit.
    Completed,
    /// Observed the stop flag.
    Stopped,
    /// Reached its consecutive connection failure limit.
    GaveUp,
    /// Terminated by force.
    Killed,
    /// Panicked or failed to start its runtime.
    Crashed,
}

/// Exit notification, the last thing a worker sends.
#[derive(Debug)]
pub struct WorkerExit {
    pub pid: WorkerPid,
    pub id: u64,
    pub outcome: Outcome,
    pub stats: WorkerStats,
}

/// Request template built once per worker.
#[derive(Debug, Clone)]
pub struct Payload {
    headers: HeaderMap,
    /// Whether "Host" was given explicitly.
    has_host: bool,
}

impl Payload {
    pub fn new(headers: &[Header]) -> Self {
        let mut map = HeaderMap::with_capacity(headers.len());
        for Header { name, value } in headers {
            map.append(name.clone(), value.clone());
        }
        let has_host = map.contains_key(header::HOST);

        Self { headers: map, has_host }
    }

    /// Builds a GET request for the given target.
    pub fn request(&self, target: &Target) -> Result<Request<Empty<Bytes>>, http::Error> {
        let mut request = Request::builder().method(Method::GET).uri(target.path_and_query());
        if !self.has_host {
            request = request.header(header::HOST, target.authority().as_str());
        }

        let mut request = request.body(Empty::new())?;
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        Ok(request)
    }
}

/// Everything a worker owns while running.
#[derive(Debug)]
pub struct WorkerContext {
    cfg: WorkerConfig,
    /// Live connection, if any.
    conn: Option<Connection>,
    payload: Payload,
    stats: WorkerStats,
}

impl WorkerContext {
    /// Builds the request payload and an unconnected context for the given
    /// configuration.
    pub fn new(cfg: WorkerConfig) -> Result<Self, SpawnError> {
        let payload = Payload::new(&cfg.headers);
        if let Err(source) = payload.request(&cfg.url) {
            return Err(SpawnError::Payload { id: cfg.id, source });
        }

        let m = Self {
            cfg,
            conn: None,
            payload,
            stats: WorkerStats::default(),
        };

        Ok(m)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.cfg.id
    }
}

/// Everything needed to start a worker.
#[derive(Debug)]
pub struct Job {
    pub pid: WorkerPid,
    pub ctx: WorkerContext,
    /// Cooperative stop flag.
    pub stop: StopToken,
    /// Fires on forced termination.
    pub kill: oneshot::Receiver<()>,
    /// Exit notification channel.
    pub exit: UnboundedSender<WorkerExit>,
}

/// Starts isolated workers.
pub trait Launch {
    /// Starts the given job, returning the handle of its execution unit.
    fn launch(&mut self, job: Job) -> Result<JoinHandle<()>, SpawnError>;
}
