use clap::Parser;
use tracing_subscriber::EnvFilter;

use planner::api::{Cli, run_cli, run_http_server};

#[tokio::main]
async fn main() {
    // Logs go to stderr so `run` output stays pipeable JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let port = match tokio::task::spawn_blocking(move || run_cli(cli)).await {
        Ok(Ok(Some(port))) => port,
        Ok(Ok(None)) => return,
        Ok(Err(msg)) => {
            eprintln!("Error: {msg}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_http_server(port).await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
