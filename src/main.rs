use clap::Parser;

use overseer::cli::{run, Cli};
use overseer::logging::init_tracing;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");
    let code = runtime.block_on(run(cli));
    drop(runtime);
    std::process::exit(code);
}
