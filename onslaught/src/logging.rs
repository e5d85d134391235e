use core::error::Error;

use log::LevelFilter;
use simple_logger::SimpleLogger;

/// Installs the global logger.
///
/// Only this crate's records are emitted; the verbosity raises the level from
/// info to debug and then trace.
pub fn init(verbosity: u8) -> Result<(), Box<dyn Error>> {
    SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level("onslaught", level(verbosity))
        .with_utc_timestamps()
        .init()?;

    Ok(())
}

fn level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
