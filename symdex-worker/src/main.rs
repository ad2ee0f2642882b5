//! Symdex Worker - serves index operations over stdin/stdout
//!
//! Reads one request per line on stdin and answers each on stdout. Logs go
//! to stderr, which the host captures for diagnostics.

use clap::Parser;
use std::io::BufWriter;
use symdex_core::{Server, PROTOCOL_VERSION};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "symdex-worker")]
#[command(about = "Symdex index worker (spawned by symdex, speaks line-delimited JSON on stdio)", long_about = None)]
#[command(version)]
struct Args {
    /// Log filter for stderr (e.g. "debug", "symdex_core=trace")
    #[arg(long, env = "SYMDEX_LOG", default_value = "warn")]
    log: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(pid = std::process::id(), protocol = PROTOCOL_VERSION, "worker ready");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut server = Server::new(stdin.lock(), BufWriter::new(stdout.lock()));

    if let Err(e) = server.run() {
        eprintln!("symdex-worker: {}", e);
        std::process::exit(1);
    }
}
