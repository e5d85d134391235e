use std::io;

use onslaught::{
    cfg::Config,
    cmd::Invocation,
    error::{Error, EXIT_FAILURE},
    runtime::Runtime,
    shutdown,
};
use tokio::runtime::Builder;

pub fn main() {
    let invocation = Invocation::parse();
    if let Err(err) = onslaught::logging::init(invocation.verbose) {
        eprintln!("ERROR: failed to initialize logging: {err}");
        std::process::exit(EXIT_FAILURE);
    }

    if let Err(err) = run(invocation) {
        eprintln!("ERROR: {err}");
        std::process::exit(err.exit_code());
    }
}

fn run(invocation: Invocation) -> Result<(), Error> {
    let cfg: Config = invocation.try_into()?;
    let json = cfg.json;

    // Workers run on their own threads, this one only orchestrates.
    let report = Builder::new_current_thread()
        .enable_all()
        .thread_name("runtime")
        .build()?
        .block_on(async {
            let runtime = Runtime::new(cfg);

            runtime.run(shutdown::signal()).await
        });

    if json {
        println!("{}", report.to_json().map_err(io::Error::from)?);
    } else {
        print!("{report}");
    }

    Ok(())
}
