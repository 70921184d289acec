use clap::Parser;
use satie::{Config, Server};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "satie")]
#[command(about = "A minimalist event-driven static file server")]
#[command(version)]
struct Cli {
    /// Directory to serve (falls back to ROOT_PATH from the environment)
    root: Option<String>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of worker threads (default: all cores)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Per-worker connection slab size
    #[arg(long)]
    max_fd: Option<usize>,

    /// Idle keep-alive timeout in seconds
    #[arg(long)]
    keep_alive: Option<u32>,

    /// Directory index file name
    #[arg(long)]
    index: Option<String>,

    /// Seconds a cached artifact stays fresh
    #[arg(long)]
    cache_ttl: Option<u64>,
}

fn main() -> ExitCode {
    satie::init_logging();

    let cli = Cli::parse();

    // CLI flags override environment configuration.
    let mut config = match &cli.root {
        Some(root) => Config::for_root(root.clone()),
        None => match Config::from_env() {
            Ok(c) => c,
            Err(e) => {
                eprintln!("satie: {}", e);
                eprintln!("usage: satie <root> [options], or set ROOT_PATH");
                return ExitCode::FAILURE;
            }
        },
    };

    if let Some(host) = cli.host {
        config.server_host = host;
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }
    if let Some(max_fd) = cli.max_fd {
        config.worker_max_fd = max_fd;
    }
    if let Some(keep_alive) = cli.keep_alive {
        config.keep_alive_timeout = keep_alive;
    }
    if let Some(index) = cli.index {
        config.index_html = index;
    }
    if let Some(ttl) = cli.cache_ttl {
        config.cache_ttl = ttl;
    }

    let server = match Server::bind(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("satie: failed to bind: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match server.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("satie: {}", e);
            ExitCode::FAILURE
        }
    }
}
