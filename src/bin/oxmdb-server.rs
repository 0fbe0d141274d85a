//! The exmdb storage daemon: opens the engine, binds the RPC listener and
//! serves per-user mailbox stores under the configured prefixes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oxmdb::config::ConfigFile;
use oxmdb::exmdb::server::{ExmdbServer, ServedPrefix};
use oxmdb::store::{Engine, Limits};

#[derive(Parser)]
#[command(name = "oxmdb-server", about = "Exchange-compatible mailbox store daemon")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/oxmdb/oxmdb.cfg")]
    config: PathBuf,

    /// Store prefixes to serve (defaults to <data_path>/user/)
    #[arg(short, long)]
    prefix: Vec<String>,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match ConfigFile::load(&cli.config) {
        Ok(config) => config,
        Err(_) => {
            // a missing config file is not fatal; defaults apply
            info!("no config at {}; using defaults", cli.config.display());
            ConfigFile::default()
        }
    };

    let listen_ip = config.get_or("exmdb_listen_ip", "::1").to_owned();
    let listen_port = config.get_u32("exmdb_listen_port", 5000);
    let limits = Limits {
        max_rcpt: config.get_u32("max_rcpt", 256),
        max_message: config.get_u32("max_message", 64 * 1024 * 1024),
    };
    let data_path = config.get_or("data_path", "/var/lib/oxmdb").to_owned();

    let mut prefixes: Vec<ServedPrefix> = cli
        .prefix
        .iter()
        .map(|p| ServedPrefix { prefix: p.clone(), private: true })
        .collect();
    if prefixes.is_empty() {
        prefixes.push(ServedPrefix { prefix: format!("{data_path}/user/"), private: true });
        prefixes.push(ServedPrefix { prefix: format!("{data_path}/domain/"), private: false });
    }

    let engine = Engine::new(limits);
    let bind = format!("{listen_ip}:{listen_port}");
    let server = match ExmdbServer::start(&bind, Arc::clone(&engine), prefixes) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("oxmdb-server: cannot listen on {bind}: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    info!("serving exmdb on {}", server.local_addr());

    // the accept loop carries the process from here
    loop {
        std::thread::park();
    }
}
