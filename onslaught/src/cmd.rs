use core::iter;
use std::{
    ffi::{OsStr, OsString},
    fs,
    path::PathBuf,
};

use clap::{ArgAction, Args, Parser};

use crate::{
    cfg::{Directive, RespawnPolicy, DEFAULT_GRACE},
    error::ConfigError,
};

/// Send HTTP requests to URL from a fleet of parallel processes.
///
/// A URL may be specified in the process configuration, which overrides the
/// global URL assignment. URL is in the format:
/// [protocol://]host[:port][/path?args]
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
#[command(args_override_self = true)]
#[command(override_usage = "onslaught [options...] URL\n       \
                            onslaught [options...] [URL] -P PROCESS [process options...] [URL] ...")]
pub struct Cmd {
    /// Number of parallel processes to run (default 5).
    #[clap(short, long, value_name = "PROCESSES")]
    pub processes: Option<u64>,
    /// Specify process options for the process identified by PROCESS: a
    /// number from 1 to PROCESSES, or 0 to return to the global options.
    ///
    /// This option may be used multiple times.
    #[clap(short = 'P', long, value_name = "PROCESS")]
    pub configure: Option<u64>,
    /// Per-process options.
    #[clap(flatten)]
    pub process: ProcessCmd,
    /// Time in milliseconds to wait for processes to stop before killing them.
    #[clap(long, value_name = "MS")]
    pub grace: Option<u64>,
    /// Whether to restart processes that exit on their own.
    #[clap(long, value_enum)]
    pub respawn: Option<RespawnPolicy>,
    /// Print the final report as JSON.
    #[clap(long)]
    pub json: bool,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Options scoped to the currently selected process.
#[derive(Debug, Clone, Args)]
pub struct ProcessCmd {
    /// Minimum delay in milliseconds between requests.
    ///
    /// If specified, the process will choose a random delay between DELAY
    /// and MAX_DELAY.
    #[clap(short, long, value_name = "DELAY")]
    pub delay: Option<u64>,
    /// Maximum delay in milliseconds between requests.
    ///
    /// If not specified, defaults to DELAY.
    #[clap(short = 'D', long, value_name = "MAX_DELAY")]
    pub max_delay: Option<u64>,
    /// Pass custom header(s) to server.
    #[clap(short = 'H', long = "header", value_name = "HEADER/@FILE", action = ArgAction::Append)]
    pub headers: Vec<String>,
    /// Follow redirects.
    #[clap(short = 'L', long)]
    pub location: bool,
    /// Timeout in milliseconds for each request.
    #[clap(short, long, value_name = "TIMEOUT")]
    pub max_time: Option<u64>,
    /// Stop the process after this many requests.
    #[clap(short = 'n', long, value_name = "NUM")]
    pub requests: Option<u64>,
    /// Give up after this many consecutive connection failures.
    #[clap(long, value_name = "NUM")]
    pub max_connect_failures: Option<u64>,
    /// Target URL.
    pub url: Vec<String>,
}

impl Cmd {
    /// Lowers the parsed segment into directives, preserving its scope.
    fn push_directives(self, directives: &mut Vec<Directive>) {
        let Self { processes, configure, process, .. } = self;
        let ProcessCmd {
            delay,
            max_delay,
            headers,
            location,
            max_time,
            requests,
            max_connect_failures,
            url,
        } = process;

        directives.extend(configure.map(Directive::Configure));
        directives.extend(processes.map(Directive::Processes));
        directives.extend(delay.map(Directive::Delay));
        directives.extend(max_delay.map(Directive::MaxDelay));
        directives.extend(max_time.map(Directive::MaxTime));
        if location {
            directives.push(Directive::Location);
        }
        directives.extend(requests.map(Directive::Requests));
        directives.extend(max_connect_failures.map(Directive::MaxConnectFailures));
        directives.extend(headers.into_iter().map(Directive::Header));
        directives.extend(url.into_iter().map(Directive::Url));
    }
}

/// Parsed command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Configuration overrides in command line order.
    pub directives: Vec<Directive>,
    pub respawn: RespawnPolicy,
    /// Grace window, ms.
    pub grace: u64,
    pub json: bool,
    pub verbose: u8,
}

impl Invocation {
    /// Parses the given arguments, the first one being the binary name.
    ///
    /// Options following `-P` apply to that process only, so the arguments
    /// are split at each `-P` and every segment is parsed on its own.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut args = args.into_iter().map(Into::into);
        let bin = args.next().unwrap_or_else(|| OsString::from("onslaught"));

        let mut m = Self {
            directives: Vec::new(),
            respawn: RespawnPolicy::default(),
            grace: DEFAULT_GRACE,
            json: false,
            verbose: 0,
        };

        for segment in split_segments(args) {
            let cmd = Cmd::try_parse_from(iter::once(bin.clone()).chain(segment))?;

            if let Some(respawn) = cmd.respawn {
                m.respawn = respawn;
            }
            if let Some(grace) = cmd.grace {
                m.grace = grace;
            }
            m.json |= cmd.json;
            m.verbose = m.verbose.saturating_add(cmd.verbose);

            cmd.push_directives(&mut m.directives);
        }

        Ok(m)
    }

    /// Parses the process arguments, printing help or usage and exiting on
    /// failure.
    pub fn parse() -> Self {
        match Self::try_parse_from(std::env::args_os()) {
            Ok(m) => m,
            Err(err) => err.exit(),
        }
    }
}

/// Splits arguments before each process selector.
fn split_segments<I>(args: I) -> Vec<Vec<OsString>>
where
    I: IntoIterator<Item = OsString>,
{
    let mut segments = vec![Vec::new()];
    let mut escaped = false;

    for arg in args {
        if !escaped {
            if let Some((flags, selector)) = split_cluster(&arg) {
                if let Some(segment) = segments.last_mut() {
                    segment.push(flags);
                }
                segments.push(vec![selector]);
                continue;
            }
            if is_selector(&arg) {
                segments.push(Vec::new());
            }
        }
        escaped |= arg == "--";

        if let Some(segment) = segments.last_mut() {
            segment.push(arg);
        }
    }

    segments
}

fn is_selector(arg: &OsStr) -> bool {
    match arg.to_str() {
        Some(v) => v == "--configure" || v.starts_with("--configure=") || v.starts_with("-P"),
        None => false,
    }
}

/// Short options taking no value, which may precede "P" in a cluster.
const SHORT_FLAGS: &[char] = &['L', 'v', 'h', 'V'];

/// Splits a short option cluster ending in a selector, like "-LP2", into its
/// flags "-L" and the selector "-P2".
fn split_cluster(arg: &OsStr) -> Option<(OsString, OsString)> {
    let cluster = arg.to_str()?.strip_prefix('-')?;
    if cluster.starts_with('-') {
        return None;
    }

    let pos = cluster.find(|c: char| !SHORT_FLAGS.contains(&c))?;
    if pos == 0 || !cluster[pos..].starts_with('P') {
        return None;
    }

    let (flags, selector) = cluster.split_at(pos);
    Some((format!("-{flags}").into(), format!("-{selector}").into()))
}

/// Replaces "@FILE" header directives with one header directive per non-empty
/// line of FILE.
pub fn expand_header_files(directives: Vec<Directive>) -> Result<Vec<Directive>, ConfigError> {
    let mut expanded = Vec::with_capacity(directives.len());

    for directive in directives {
        match directive {
            Directive::Header(v) if v.starts_with('@') => {
                let path = PathBuf::from(&v[1..]);
                log::debug!("loading headers from '{}' ...", path.display());

                let data = match fs::read_to_string(&path) {
                    Ok(data) => data,
                    Err(source) => return Err(ConfigError::HeaderFile { path, source }),
                };

                let headers = data
                    .lines()
                    .map(|line| line.trim_end_matches('\r'))
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| Directive::Header(line.to_string()));
                expanded.extend(headers);
            }
            directive => expanded.push(directive),
        }
    }

    Ok(expanded)
}
