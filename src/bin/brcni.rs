use brcni::commands::{error_result, run_cni};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() {
    // stdout belongs to the runtime; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        if let Err(print_err) = error_result(&err).print() {
            eprintln!("failed to print error result: {}", print_err);
        }
        std::process::exit(1);
    }
}
