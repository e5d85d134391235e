pub mod cfg;
pub mod cmd;
pub mod engine;
pub mod error;
pub mod histogram;
pub mod logging;
pub mod runtime;
pub mod shutdown;
pub mod stat;
#[cfg(test)]
mod testing;
