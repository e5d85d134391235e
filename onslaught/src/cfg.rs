use core::{
    fmt::{self, Display, Formatter},
    num::NonZero,
    ops::RangeInclusive,
    str::FromStr,
    time::Duration,
};
use std::collections::{HashMap, HashSet};

use clap::ValueEnum;
use http::{
    uri::{Authority, PathAndQuery, Scheme},
    HeaderName, HeaderValue, Uri,
};

use crate::{
    cmd::{self, Invocation},
    error::{ConfigError, Error, ResourceError},
};

/// Number of workers when none specified.
pub const DEFAULT_PROCESSES: u64 = 5;
/// Per-request timeout in milliseconds when none specified.
pub const DEFAULT_MAX_TIME: u64 = 5000;
/// Grace window in milliseconds when none specified.
pub const DEFAULT_GRACE: u64 = 10000;

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-worker configuration table.
    pub table: ConfigTable,
    /// What to do with a slot whose worker has exited.
    pub respawn: RespawnPolicy,
    /// How long to wait for workers to stop cooperatively.
    pub grace: Duration,
    /// Emit the final report as JSON.
    pub json: bool,
}

impl TryFrom<Invocation> for Config {
    type Error = Error;

    fn try_from(v: Invocation) -> Result<Self, Self::Error> {
        let Invocation { directives, respawn, grace, json, .. } = v;

        let directives = cmd::expand_header_files(directives)?;
        let table = resolve(directives)?;

        let m = Self {
            table,
            respawn,
            grace: Duration::from_millis(grace),
            json,
        };

        Ok(m)
    }
}

/// Whether a worker slot is started again once its worker exits on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RespawnPolicy {
    /// Slot completion is final.
    #[default]
    Never,
    /// Respawn workers that gave up or crashed.
    OnFailure,
    /// Respawn every worker that exits before termination is requested.
    Always,
}

/// A single configuration override, in command line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Set the number of workers.
    Processes(u64),
    /// Select the block that following directives apply to. Zero selects the
    /// global block.
    Configure(u64),
    /// Minimum delay between requests, ms.
    Delay(u64),
    /// Maximum delay between requests, ms.
    MaxDelay(u64),
    /// Raw "Name: value" header line.
    Header(String),
    /// Follow redirects.
    Location,
    /// Per-request timeout, ms.
    MaxTime(u64),
    /// Target URL.
    Url(String),
    /// Stop the worker after this many counted requests.
    Requests(u64),
    /// Give up after this many consecutive connection failures.
    MaxConnectFailures(u64),
}

/// HTTP header, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl FromStr for Header {
    type Err = ConfigError;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidHeader { header: v.to_string(), reason };

        let (name, value) = v
            .split_once(':')
            .ok_or_else(|| invalid("expected 'Name: value'".to_string()))?;
        let name = HeaderName::from_str(name.trim()).map_err(|err| invalid(err.to_string()))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|err| invalid(err.to_string()))?;

        Ok(Self { name, value })
    }
}

/// Request target: an absolute http URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    uri: Uri,
    authority: Authority,
}

impl Target {
    /// Parses `[scheme://]host[:port][/path?query]`, defaulting to http.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri = if url.contains("://") {
            Uri::from_str(url)
        } else {
            Uri::from_str(&format!("http://{url}"))
        };
        let uri = uri.map_err(|err| invalid(&err.to_string()))?;

        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
            Some(scheme) => {
                return Err(ConfigError::UnsupportedScheme {
                    url: url.to_string(),
                    scheme: scheme.to_string(),
                });
            }
            None => return Err(invalid("missing scheme")),
        }

        let authority = match uri.authority() {
            Some(authority) if !authority.host().is_empty() => authority.clone(),
            _ => return Err(invalid("missing host")),
        };

        Ok(Self { uri, authority })
    }

    /// Resolves a redirect location against this target.
    pub fn join(&self, location: &str) -> Result<Self, ConfigError> {
        if location.contains("://") {
            return Self::parse(location);
        }
        if let Some(rest) = location.strip_prefix("//") {
            return Self::parse(rest);
        }

        let path = if location.starts_with('/') {
            location.to_string()
        } else {
            let base = self.uri.path();
            let dir = match base.rfind('/') {
                Some(idx) => &base[..=idx],
                None => "/",
            };
            format!("{dir}{location}")
        };

        let invalid = |reason: String| ConfigError::InvalidUrl { url: location.to_string(), reason };
        let path = PathAndQuery::from_str(&path).map_err(|err| invalid(err.to_string()))?;
        let uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path)
            .build()
            .map_err(|err| invalid(err.to_string()))?;

        Ok(Self { uri, authority: self.authority.clone() })
    }

    #[inline]
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Host name or IP address, without IPv6 brackets.
    #[inline]
    pub fn host(&self) -> &str {
        self.authority().host().trim_start_matches('[').trim_end_matches(']')
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.authority().port_u16().unwrap_or(80)
    }

    /// Request path and query, "/" when absent.
    #[inline]
    pub fn path_and_query(&self) -> &str {
        match self.uri.path_and_query().map(PathAndQuery::as_str) {
            Some(v) if !v.is_empty() => v,
            _ => "/",
        }
    }
}

impl Display for Target {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        Display::fmt(&self.uri, fmt)
    }
}

/// Randomized inter-request delay interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacingWindow {
    pub min: Duration,
    pub max: Duration,
}

impl PacingWindow {
    #[inline]
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Returns `true` when no pacing sleep should be performed.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }
}

/// Configuration block for a single identity, as it is being built.
///
/// Identity zero holds the global defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Minimum delay in milliseconds between requests.
    pub delay: u64,
    /// Maximum delay in milliseconds between requests.
    ///
    /// Same as `delay` when not specified.
    pub max_delay: Option<u64>,
    /// Per-request timeout in milliseconds.
    pub max_time: u64,
    /// Headers in declaration order, duplicates included.
    pub headers: Vec<Header>,
    /// Follow redirects.
    pub location: bool,
    pub url: Option<Target>,
    /// Maximum number of counted requests, zero for unlimited.
    pub requests: u64,
    /// Maximum number of consecutive connection failures, zero for unlimited.
    pub max_connect_failures: u64,
}

/// The configuration for identity zero.
pub type GlobalConfig = ProcessConfig;

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            delay: 0,
            max_delay: None,
            max_time: DEFAULT_MAX_TIME,
            headers: Vec::new(),
            location: false,
            url: None,
            requests: 0,
            max_connect_failures: 0,
        }
    }
}

impl ProcessConfig {
    #[inline]
    pub fn pacing(&self) -> PacingWindow {
        PacingWindow::from_millis(self.delay, self.max_delay.unwrap_or(self.delay))
    }

    /// Produces the effective configuration of the given identity from this
    /// block.
    pub fn resolve(&self, id: u64) -> Result<WorkerConfig, ConfigError> {
        let url = self.url.clone().ok_or(ConfigError::MissingUrl { id })?;

        let m = WorkerConfig {
            id,
            pacing: self.pacing(),
            max_time: Duration::from_millis(self.max_time),
            headers: self.headers.clone(),
            follow_redirects: self.location,
            url,
            requests: NonZero::new(self.requests),
            max_connect_failures: NonZero::new(self.max_connect_failures),
        };

        Ok(m)
    }

    fn validate(&self, id: u64) -> Result<(), ConfigError> {
        if let Some(max) = self.max_delay {
            if self.delay > max {
                return Err(ConfigError::InvalidDelay { id, min: self.delay, max });
            }
        }

        Ok(())
    }
}

/// Effective configuration of a single worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Worker identity, `1..=processes`.
    pub id: u64,
    pub pacing: PacingWindow,
    /// Per-request timeout.
    pub max_time: Duration,
    pub headers: Vec<Header>,
    pub follow_redirects: bool,
    pub url: Target,
    /// Stop after this many counted requests.
    pub requests: Option<NonZero<u64>>,
    /// Give up after this many consecutive connection failures.
    pub max_connect_failures: Option<NonZero<u64>>,
}

/// Immutable identity to configuration mapping.
#[derive(Debug, Clone)]
pub struct ConfigTable {
    processes: NonZero<u64>,
    global: GlobalConfig,
    blocks: HashMap<u64, ProcessConfig>,
}

impl ConfigTable {
    #[inline]
    pub fn processes(&self) -> NonZero<u64> {
        self.processes
    }

    #[inline]
    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    /// Returns all worker identities.
    #[inline]
    pub fn identities(&self) -> RangeInclusive<u64> {
        1..=self.processes.get()
    }

    /// Returns the effective configuration for the given identity.
    ///
    /// Identities without an explicit block inherit the global configuration.
    pub fn resolve(&self, id: u64) -> Result<WorkerConfig, ConfigError> {
        if !self.identities().contains(&id) {
            return Err(ConfigError::InvalidProcess { id, max: self.processes.get() });
        }

        self.blocks.get(&id).unwrap_or(&self.global).resolve(id)
    }
}

/// Builds the configuration table from directives.
#[derive(Debug)]
pub struct Resolver {
    processes: u64,
    global: GlobalConfig,
    blocks: HashMap<u64, ProcessConfig>,
    /// Identities that were given their own URL.
    urls: HashSet<u64>,
    /// Currently selected identity, zero for global.
    active: u64,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            processes: DEFAULT_PROCESSES,
            global: GlobalConfig::default(),
            blocks: HashMap::new(),
            urls: HashSet::new(),
            active: 0,
        }
    }

    pub fn apply(&mut self, directive: Directive) -> Result<(), Error> {
        match directive {
            Directive::Processes(v) => self.processes = v,
            Directive::Configure(id) => self.select(id)?,
            Directive::Delay(v) => self.active_mut().delay = v,
            Directive::MaxDelay(v) => self.active_mut().max_delay = Some(v),
            Directive::Header(v) => {
                let header: Header = v.parse()?;
                let headers = &mut self.active_mut().headers;
                headers
                    .try_reserve(1)
                    .map_err(|err| ResourceError::new("header", err))?;
                headers.push(header);
            }
            Directive::Location => self.active_mut().location = true,
            Directive::MaxTime(0) => return Err(ConfigError::InvalidMaxTime.into()),
            Directive::MaxTime(v) => self.active_mut().max_time = v,
            Directive::Url(v) => {
                if !self.urls.insert(self.active) {
                    return Err(ConfigError::DuplicateUrl { id: self.active, url: v }.into());
                }
                self.active_mut().url = Some(Target::parse(&v)?);
            }
            Directive::Requests(v) => self.active_mut().requests = v,
            Directive::MaxConnectFailures(v) => self.active_mut().max_connect_failures = v,
        }

        Ok(())
    }

    /// Validates the collected configuration and freezes it.
    pub fn finish(self) -> Result<ConfigTable, Error> {
        let processes = NonZero::new(self.processes).ok_or(ConfigError::NoProcesses)?;

        let mut ids: Vec<u64> = Vec::new();
        ids.try_reserve(self.blocks.len())
            .map_err(|err| ResourceError::new("process configuration", err))?;
        ids.extend(self.blocks.keys().copied());
        ids.sort_unstable();

        if let Some(&id) = ids.iter().find(|&&id| id > processes.get()) {
            return Err(ConfigError::InvalidProcess { id, max: processes.get() }.into());
        }

        self.global.validate(0)?;
        for &id in &ids {
            self.blocks[&id].validate(id)?;
        }

        // Make sure all processes get at least one URL, either from their own
        // block or inherited.
        for id in 1..=processes.get() {
            let pconf = self.blocks.get(&id).unwrap_or(&self.global);
            if pconf.url.is_none() {
                return Err(ConfigError::MissingUrl { id }.into());
            }
        }

        let m = ConfigTable {
            processes,
            global: self.global,
            blocks: self.blocks,
        };

        Ok(m)
    }

    fn select(&mut self, id: u64) -> Result<(), ResourceError> {
        if id != 0 && !self.blocks.contains_key(&id) {
            self.blocks
                .try_reserve(1)
                .map_err(|err| ResourceError::new("process configuration", err))?;
            // The block starts as a snapshot of the global config as it is now.
            self.blocks.insert(id, self.global.clone());
        }
        self.active = id;

        Ok(())
    }

    #[inline]
    fn active_mut(&mut self) -> &mut ProcessConfig {
        match self.blocks.get_mut(&self.active) {
            Some(pconf) => pconf,
            None => &mut self.global,
        }
    }
}

/// Applies directives in order and builds the validated configuration table.
pub fn resolve<I>(directives: I) -> Result<ConfigTable, Error>
where
    I: IntoIterator<Item = Directive>,
{
    let mut resolver = Resolver::new();
    for directive in directives {
        resolver.apply(directive)?;
    }

    resolver.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    fn url(v: &str) -> Directive {
        Directive::Url(v.to_string())
    }

    fn header(v: &str) -> Directive {
        Directive::Header(v.to_string())
    }

    fn config_err(directives: Vec<Directive>) -> ConfigError {
        match resolve(directives) {
            Err(Error::Config(err)) => err,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn defaults() {
        let table = resolve([url("localhost")]).unwrap();

        assert_eq!(5, table.processes().get());
        assert_eq!(1..=5, table.identities());

        let cfg = table.resolve(1).unwrap();
        assert_eq!(PacingWindow::default(), cfg.pacing);
        assert!(cfg.pacing.is_zero());
        assert_eq!(Duration::from_millis(5000), cfg.max_time);
        assert!(cfg.headers.is_empty());
        assert!(!cfg.follow_redirects);
        assert_eq!("http://localhost/", cfg.url.to_string());
        assert_eq!(None, cfg.requests);
        assert_eq!(None, cfg.max_connect_failures);
    }

    #[test]
    fn workers_without_overrides_inherit_global() {
        let table = resolve([Directive::Processes(3), url("http://a.test/x"), Directive::Delay(7)]).unwrap();

        let global = table.global().resolve(0).unwrap();
        for id in table.identities() {
            let cfg = table.resolve(id).unwrap();
            assert_eq!(WorkerConfig { id: 0, ..cfg.clone() }, global);
            assert_eq!(id, cfg.id);
        }
    }

    #[test]
    fn per_worker_overrides() {
        let table = resolve([
            Directive::Processes(2),
            Directive::Configure(1),
            Directive::Delay(100),
            Directive::MaxDelay(500),
            header("X: 1"),
            url("A"),
            Directive::Configure(2),
            url("B"),
        ])
        .unwrap();

        let w1 = table.resolve(1).unwrap();
        assert_eq!(PacingWindow::from_millis(100, 500), w1.pacing);
        assert_eq!(vec!["X: 1".parse::<Header>().unwrap()], w1.headers);
        assert_eq!("A", w1.url.host());

        let w2 = table.resolve(2).unwrap();
        assert_eq!(PacingWindow::from_millis(0, 0), w2.pacing);
        assert!(w2.headers.is_empty());
        assert_eq!("B", w2.url.host());
    }

    #[test]
    fn block_is_snapshot_of_global_at_declaration() {
        let table = resolve([
            url("example.com"),
            Directive::Delay(10),
            Directive::Configure(1),
            Directive::Configure(0),
            Directive::Delay(50),
            header("X-Late: yes"),
        ])
        .unwrap();

        // Block 1 was opened before the global delay changed.
        let w1 = table.resolve(1).unwrap();
        assert_eq!(PacingWindow::from_millis(10, 10), w1.pacing);
        assert!(w1.headers.is_empty());

        // Undeclared workers see the final global state.
        let w2 = table.resolve(2).unwrap();
        assert_eq!(PacingWindow::from_millis(50, 50), w2.pacing);
        assert_eq!(1, w2.headers.len());
    }

    #[test]
    fn resolve_is_idempotent() {
        let table = resolve([url("example.com"), Directive::Configure(3), Directive::Location]).unwrap();

        assert_eq!(table.resolve(3).unwrap(), table.resolve(3).unwrap());
        assert!(table.resolve(3).unwrap().follow_redirects);
        assert!(!table.resolve(2).unwrap().follow_redirects);
    }

    #[test]
    fn max_delay_defaults_to_delay() {
        let table = resolve([url("example.com"), Directive::Delay(250)]).unwrap();

        assert_eq!(PacingWindow::from_millis(250, 250), table.resolve(1).unwrap().pacing);
    }

    #[test]
    fn inverted_pacing_window_is_rejected() {
        let err = config_err(vec![
            url("example.com"),
            Directive::Configure(2),
            Directive::Delay(500),
            Directive::MaxDelay(100),
        ]);

        assert!(matches!(err, ConfigError::InvalidDelay { id: 2, min: 500, max: 100 }));
    }

    #[test]
    fn headers_keep_order_and_duplicates() {
        let table = resolve([url("example.com"), header("X: 1"), header("Y: 2"), header("X: 3")]).unwrap();

        let headers: Vec<_> = table
            .resolve(1)
            .unwrap()
            .headers
            .into_iter()
            .map(|h| format!("{}={}", h.name, h.value.to_str().unwrap()))
            .collect();
        assert_eq!(vec!["x=1", "y=2", "x=3"], headers);
    }

    #[test]
    fn block_headers_extend_inherited_headers() {
        let table = resolve([url("example.com"), header("A: 1"), Directive::Configure(1), header("B: 2")]).unwrap();

        assert_eq!(2, table.resolve(1).unwrap().headers.len());
        assert_eq!(1, table.resolve(2).unwrap().headers.len());
    }

    #[test]
    fn zero_processes() {
        let err = config_err(vec![url("example.com"), Directive::Processes(0)]);

        assert!(matches!(err, ConfigError::NoProcesses));
        assert_eq!("must have at least one process", err.to_string());
    }

    #[test]
    fn missing_url_names_first_unresolved_worker() {
        let err = config_err(vec![
            Directive::Processes(3),
            Directive::Configure(1),
            url("a"),
            Directive::Configure(3),
            url("c"),
        ]);

        assert!(matches!(err, ConfigError::MissingUrl { id: 2 }));
    }

    #[test]
    fn every_worker_may_bring_its_own_url() {
        let table = resolve([
            Directive::Processes(2),
            Directive::Configure(1),
            url("a"),
            Directive::Configure(2),
            url("b:8080/status?full=1"),
        ])
        .unwrap();

        let w2 = table.resolve(2).unwrap();
        assert_eq!(8080, w2.url.port());
        assert_eq!("/status?full=1", w2.url.path_and_query());
    }

    #[test]
    fn block_out_of_range() {
        let err = config_err(vec![url("a"), Directive::Processes(2), Directive::Configure(3)]);
        assert!(matches!(err, ConfigError::InvalidProcess { id: 3, max: 2 }));

        let table = resolve([url("a"), Directive::Processes(2)]).unwrap();
        assert!(matches!(table.resolve(0), Err(ConfigError::InvalidProcess { id: 0, .. })));
        assert!(matches!(table.resolve(3), Err(ConfigError::InvalidProcess { id: 3, .. })));
    }

    #[test]
    fn processes_may_be_raised_after_selecting_block() {
        let table = resolve([url("a"), Directive::Configure(7), Directive::Processes(8)]).unwrap();

        assert_eq!(8, table.processes().get());
    }

    #[test]
    fn second_url_in_block() {
        let err = config_err(vec![url("a"), url("b")]);
        assert!(matches!(err, ConfigError::DuplicateUrl { id: 0, .. }));

        // Overriding an inherited URL is fine.
        let table = resolve([url("a"), Directive::Configure(1), url("b")]).unwrap();
        assert_eq!("b", table.resolve(1).unwrap().url.host());
    }

    #[test]
    fn malformed_values() {
        assert!(matches!(config_err(vec![url("a"), header("nocolon")]), ConfigError::InvalidHeader { .. }));
        assert!(matches!(config_err(vec![url("https://a")]), ConfigError::UnsupportedScheme { .. }));
        assert!(matches!(config_err(vec![url("http://")]), ConfigError::InvalidUrl { .. }));
        assert!(matches!(config_err(vec![url("a"), Directive::MaxTime(0)]), ConfigError::InvalidMaxTime));
    }

    #[test]
    fn request_limits() {
        let table = resolve([
            url("a"),
            Directive::Requests(10),
            Directive::Configure(1),
            Directive::Requests(0),
            Directive::MaxConnectFailures(3),
        ])
        .unwrap();

        let w1 = table.resolve(1).unwrap();
        assert_eq!(None, w1.requests);
        assert_eq!(NonZero::new(3), w1.max_connect_failures);
        assert_eq!(NonZero::new(10), table.resolve(2).unwrap().requests);
    }

    #[test]
    fn target_join() {
        let base = Target::parse("http://example.com:81/a/b?q=1").unwrap();

        assert_eq!("http://example.com:81/c", base.join("/c").unwrap().to_string());
        assert_eq!("http://example.com:81/a/d", base.join("d").unwrap().to_string());
        assert_eq!("http://other/", base.join("//other/").unwrap().to_string());
        assert_eq!("http://x.test/y", base.join("http://x.test/y").unwrap().to_string());
        assert!(base.join("https://secure/").is_err());
    }

    #[test]
    fn ipv6_target() {
        let target = Target::parse("[::1]:8080/").unwrap();

        assert_eq!("::1", target.host());
        assert_eq!(8080, target.port());
    }
}
