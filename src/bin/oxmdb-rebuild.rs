//! Store rebuild tool: copies every table of `exchange.sqlite3` into a
//! fresh database file, verifies integrity, asks a running exmdb server
//! to unload the mailbox, and renames the new file into place.

use std::path::{Path, PathBuf};

use clap::Parser;
use rusqlite::Connection;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oxmdb::config::ConfigFile;
use oxmdb::exmdb::client::{ExmdbClient, RemoteConfig};
use oxmdb::exmdb::request::StoreRequest;
use oxmdb::store::schema;

#[derive(Parser)]
#[command(name = "oxmdb-rebuild", about = "Rewrite a mailbox database in place")]
struct Cli {
    /// Mailbox directory (the one containing exmdb/exchange.sqlite3)
    maildir: PathBuf,

    /// Configuration file, for reaching the exmdb server
    #[arg(short, long, default_value = "/etc/oxmdb/oxmdb.cfg")]
    config: PathBuf,

    /// Skip the unload_store RPC (server not running)
    #[arg(long)]
    offline: bool,
}

fn rebuild(maildir: &Path) -> Result<PathBuf, String> {
    let db_path = maildir.join("exmdb/exchange.sqlite3");
    if !db_path.is_file() {
        return Err(format!("{} has no store database", maildir.display()));
    }
    let fresh_path = maildir.join("exmdb/exchange.sqlite3.new");
    let _ = std::fs::remove_file(&fresh_path);

    let src = Connection::open(&db_path).map_err(|e| e.to_string())?;
    let fresh = Connection::open(&fresh_path).map_err(|e| e.to_string())?;
    fresh.execute_batch(schema::SCHEMA).map_err(|e| e.to_string())?;
    fresh
        .execute_batch(&format!("ATTACH DATABASE '{}' AS old", db_path.display()))
        .map_err(|e| e.to_string())?;
    for table in schema::TABLE_NAMES {
        info!("copying {table}");
        fresh
            .execute_batch(&format!("INSERT INTO {table} SELECT * FROM old.{table}"))
            .map_err(|e| format!("copy of {table} failed: {e}"))?;
    }
    fresh.execute_batch("DETACH DATABASE old").map_err(|e| e.to_string())?;
    if !schema::integrity_check(&fresh).map_err(|e| e.to_string())? {
        return Err("integrity_check failed on the rebuilt database".into());
    }
    drop(fresh);
    drop(src);
    Ok(fresh_path)
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let fresh_path = match rebuild(&cli.maildir) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("oxmdb-rebuild: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if !cli.offline {
        let config = ConfigFile::load(&cli.config).unwrap_or_default();
        let host = config.get_or("exmdb_listen_ip", "::1").to_owned();
        let port = config.get_u32("exmdb_listen_port", 5000) as u16;
        let client = ExmdbClient::new(1, 0, config.get_timeout("exmdb_client_rpc_timeout"));
        let dir = cli.maildir.display().to_string();
        let run = client.run(vec![RemoteConfig {
            host,
            port,
            prefix: dir.clone(),
            private: true,
            local: false,
        }]);
        match run.and_then(|_| client.call(&dir, StoreRequest::UnloadStore)) {
            Ok(_) => info!("store unloaded from the running server"),
            Err(e) => warn!("could not unload store ({e}); continuing with the rename"),
        }
    }

    let db_path = cli.maildir.join("exmdb/exchange.sqlite3");
    if let Err(e) = std::fs::rename(&fresh_path, &db_path) {
        eprintln!("oxmdb-rebuild: rename into place failed: {e}");
        return std::process::ExitCode::FAILURE;
    }
    info!("rebuilt {}", db_path.display());
    std::process::ExitCode::SUCCESS
}
