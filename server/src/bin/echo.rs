//! Echo server built on the framework.

use clap::Parser;
use io_reactor::EventLoop;
use server::config::{Config, LoggingConfig};
use server::{logging, ServerError, TcpServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "echo")]
#[command(about = "Reactor-pattern TCP echo server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => default_config(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), ServerError> {
    let base_loop = EventLoop::new()?;
    let server = TcpServer::new(Arc::clone(&base_loop), &config)?;

    server.set_connected_callback(|conn| {
        info!(peer = %conn.peer_endpoint(), "client connected");
    });
    server.set_message_callback(|conn, input| {
        let payload = input.bytes().to_vec();
        input.pop(payload.len());
        conn.send(&payload);
    });
    server.set_closed_callback(|conn| {
        info!(peer = %conn.peer_endpoint(), "client disconnected");
    });

    server.start()?;
    info!("echo server running, Ctrl-C to exit");

    // The base loop hosts the acceptor; this blocks until the process ends.
    base_loop.run();
    Ok(())
}

fn default_config() -> Config {
    Config {
        name: "echo".to_string(),
        listen_ip: "0.0.0.0".to_string(),
        port: 8080,
        io_thread_count: None,
        idle_timeout_ms: 300_000,
        idle_timeout_enabled: false,
        pool_max_bytes: io_reactor::DEFAULT_MAX_POOL_BYTES,
        logging: LoggingConfig::default(),
    }
}

fn print_default_config() {
    let config = r#"# Echo server configuration

# Identifier used in logs
name = "echo"

# IPv4 address and port to bind
listen_ip = "0.0.0.0"
port = 8080

# Number of worker loops (0 = base loop only; unset = number of CPUs)
# io_thread_count = 4

# Idle connection management
idle_timeout_ms = 300000
idle_timeout_enabled = false

# Chunk pool byte budget
pool_max_bytes = "128MB"

[logging]
# Level filter (RUST_LOG overrides)
level = "info"
# Format: "pretty", "json", or "compact"
format = "pretty"
timestamps = true
target = false
thread_names = true
"#;
    print!("{}", config);
}
