use std::{io, process::ExitCode};
use tracing_subscriber::EnvFilter;
use vadd_offload::{
    config::Config,
    workflow::{ErrorKind, Workflow},
};

fn main() -> ExitCode {
    let config = match Config::from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(e) => {
            print!("{}", e.usage());
            return if e.is_informational() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level().into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    let policy = config.mismatch_policy();
    let stdout = io::stdout();
    match Workflow::new(config).run(&mut stdout.lock()) {
        Ok(outcome) => outcome.exit_code(policy),
        Err(e) => {
            let kind = ErrorKind::of(&e);
            tracing::error!(%kind, "run failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
