//! The arbiter server daemon.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::Context;
use arbiter_net::{Server, ServerSettings};
use arbiter_proto::{TlsSupported, SUPPORTED_DECISION_ALGORITHMS, SUPPORTED_MESSAGES};
use clap::Parser;
use fs2::FileExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "arbiterd", about = "Cluster quorum arbitration server")]
struct Cli {
    /// Listen on IPv4 only.
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Listen on IPv6 only.
    #[arg(short = '6')]
    ipv6: bool,

    /// Require clients to present a TLS certificate (on|off).
    #[arg(short = 'c', default_value = "on", value_parser = parse_on_off)]
    client_cert_required: bool,

    /// Increase debug output; repeat for trace level.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Stay attached to the terminal, logging to stderr.
    #[arg(short = 'f')]
    foreground: bool,

    /// Listen address.
    #[arg(short = 'l')]
    listen_addr: Option<IpAddr>,

    /// Maximum simultaneous clients, 0 for no limit.
    #[arg(short = 'm', default_value_t = 0)]
    max_clients: usize,

    /// Listen port.
    #[arg(short = 'p', default_value_t = arbiter_net::config::DEFAULT_PORT)]
    port: u16,

    /// TLS mode (on|off|req).
    #[arg(short = 's', default_value = "on")]
    tls: String,

    /// Advanced settings, key=value[,key=value...]; repeatable.
    #[arg(short = 'S')]
    advanced: Vec<String>,

    /// Print the version with the supported messages and algorithms.
    #[arg(short = 'v')]
    version: bool,
}

fn parse_on_off(value: &str) -> Result<bool, String> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected on or off, got {:?}", other)),
    }
}

fn print_version() {
    println!("arbiterd {}", env!("CARGO_PKG_VERSION"));
    let messages: Vec<String> = SUPPORTED_MESSAGES
        .iter()
        .map(|msg| msg.to_string())
        .collect();
    println!("supported messages: {}", messages.join(", "));
    let algorithms: Vec<String> = SUPPORTED_DECISION_ALGORITHMS
        .iter()
        .map(|algorithm| algorithm.to_string())
        .collect();
    println!("supported decision algorithms: {}", algorithms.join(", "));
}

/// Create and lock the PID file; holding the lock for the process
/// lifetime is the single-instance guarantee.
fn acquire_lock(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("can't create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("can't open lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("another instance holds {}", path.display()))?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();
    if cli.version {
        print_version();
        return 0;
    }

    let default_level = match cli.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    if !cli.foreground {
        info!("running attached; use a service manager for daemonization");
    }

    let mut settings = ServerSettings::default();
    for list in &cli.advanced {
        if let Err(err) = settings.apply_advanced_list(list) {
            eprintln!("arbiterd: {}", err);
            return 1;
        }
    }
    settings.max_clients = cli.max_clients;

    let tls_supported = match cli.tls.as_str() {
        "on" => TlsSupported::Supported,
        "off" => TlsSupported::Unsupported,
        "req" => TlsSupported::Required,
        other => {
            eprintln!("arbiterd: invalid tls mode {:?}", other);
            return 1;
        }
    };

    let listen_ip = cli.listen_addr.unwrap_or(if cli.ipv6 {
        IpAddr::from([0u16; 8])
    } else {
        IpAddr::from([0u8, 0, 0, 0])
    });
    let listen = SocketAddr::new(listen_ip, cli.port);

    let _lock = match acquire_lock(&settings.lock_file) {
        Ok(lock) => lock,
        Err(err) => {
            eprintln!("arbiterd: {:#}", err);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("arbiterd: can't build runtime: {}", err);
            return 1;
        }
    };

    let result = runtime.block_on(async move {
        let server = Server {
            settings,
            tls_supported,
            tls_client_cert_required: cli.client_cert_required,
        };
        let bound = server.bind(listen).context("can't bind listen socket")?;

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("shutdown signal received");
            signal_cancel.cancel();
        });

        bound.serve(cancel).await.context("server failed")
    });

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("arbiterd: {:#}", err);
            1
        }
    }
}
