//! Daemon configuration: `key = value` files with `#` comments, merged
//! with drop-ins from a sibling `<name>.cfg.d/` directory in lexical
//! order. Unrecognized keys are kept and warned about so configs survive
//! rolling upgrades.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::types::{EcError, EcResult};

const KNOWN_KEYS: &[&str] = &[
    "exmdb_listen_ip",
    "exmdb_listen_port",
    "exmdb_client_rpc_timeout",
    "exmdb_connection_max",
    "exmdb_notify_threads_max",
    "exmdb_ping_timeout",
    "max_rcpt",
    "max_message",
    "data_path",
    "state_path",
    "config_file_path",
    "x500_org_name",
    "default_charset",
    "default_timezone",
];

#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    values: BTreeMap<String, String>,
}

impl ConfigFile {
    /// Parse one file plus its `.cfg.d/` drop-ins.
    pub fn load(path: &Path) -> EcResult<Self> {
        let mut config = ConfigFile::default();
        config.merge_file(path)?;
        let dropin_dir = path.with_extension("cfg.d");
        if dropin_dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(&dropin_dir)?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "cfg"))
                .collect();
            entries.sort();
            for entry in entries {
                config.merge_file(&entry)?;
            }
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> Self {
        let mut config = ConfigFile::default();
        config.merge_text(text, "<inline>");
        config
    }

    fn merge_file(&mut self, path: &Path) -> EcResult<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            warn!("cannot read {}: {e}", path.display());
            EcError::NotFound
        })?;
        self.merge_text(&text, &path.display().to_string());
        Ok(())
    }

    fn merge_text(&mut self, text: &str, origin: &str) {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("{origin}:{}: ignoring malformed line", lineno + 1);
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_owned();
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!("{origin}:{}: unrecognized option \"{key}\" (kept)", lineno + 1);
            }
            self.values.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Seconds; 0 disables and yields `None`.
    pub fn get_timeout(&self, key: &str) -> Option<Duration> {
        match self.get(key).and_then(|v| v.parse::<u64>().ok()) {
            None | Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_and_comments() {
        let config = ConfigFile::parse(
            "# daemon config\n\
             exmdb_listen_ip = 127.0.0.1\n\
             exmdb_listen_port = 5000\n\
             \n\
             max_rcpt = 512\n\
             some_future_option = on\n",
        );
        assert_eq!(config.get("exmdb_listen_ip"), Some("127.0.0.1"));
        assert_eq!(config.get_u32("exmdb_listen_port", 0), 5000);
        assert_eq!(config.get_u32("max_rcpt", 0), 512);
        // unrecognized keys are kept
        assert_eq!(config.get("some_future_option"), Some("on"));
    }

    #[test]
    fn zero_timeout_disables() {
        let config = ConfigFile::parse("exmdb_client_rpc_timeout = 0\n");
        assert_eq!(config.get_timeout("exmdb_client_rpc_timeout"), None);
        let config = ConfigFile::parse("exmdb_client_rpc_timeout = 30\n");
        assert_eq!(
            config.get_timeout("exmdb_client_rpc_timeout"),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn dropins_merge_in_lexical_order() {
        let tmp = tempfile::tempdir().unwrap();
        let main = tmp.path().join("oxmdb.cfg");
        std::fs::write(&main, "exmdb_listen_port = 5000\nmax_rcpt = 10\n").unwrap();
        let dropin_dir = tmp.path().join("oxmdb.cfg.d");
        std::fs::create_dir(&dropin_dir).unwrap();
        std::fs::write(dropin_dir.join("10-a.cfg"), "max_rcpt = 20\n").unwrap();
        std::fs::write(dropin_dir.join("20-b.cfg"), "max_rcpt = 30\n").unwrap();

        let config = ConfigFile::load(&main).unwrap();
        assert_eq!(config.get_u32("exmdb_listen_port", 0), 5000);
        assert_eq!(config.get_u32("max_rcpt", 0), 30);
    }
}
