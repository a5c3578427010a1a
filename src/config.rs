//! CLI parsing and the shared config map (spec §4.6, §6).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Shared config map, read by `CONFIG GET` and the replication bootstrap,
/// written once at startup by [`parse_args`].
#[derive(Default)]
pub struct Config {
    map: RwLock<HashMap<String, String>>,
}

impl Config {
    pub fn new() -> Arc<Self> {
        Arc::new(Config::default())
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.map.write().await.insert(key.into(), value.into());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.map.read().await.get(key).cloned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub port: u16,
    pub replica_of: Option<(String, u16)>,
    pub dir: Option<String>,
    pub dbfilename: Option<String>,
}

impl StartupOptions {
    pub fn rdb_path(&self) -> Option<String> {
        match (&self.dir, &self.dbfilename) {
            (Some(dir), Some(name)) => Some(format!("{dir}/{name}")),
            _ => None,
        }
    }
}

/// Parses `--port`, `--replicaof "host port"`, `--dir`, `--dbfilename` out
/// of `args` (typically `std::env::args().skip(1)`). The teacher keeps this
/// exact hand-rolled flag-walking style rather than an argument-parsing
/// crate; this is the one copy, replacing the teacher's duplicated
/// `config_handler.rs`/`env_parser.rs` pair.
pub fn parse_args<I: Iterator<Item = String>>(args: I) -> Result<StartupOptions, String> {
    let args: Vec<String> = args.collect();
    let mut opts = StartupOptions { port: 6379, ..Default::default() };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                let value = args.get(i + 1).ok_or("--port option requires an argument")?;
                opts.port = value.parse().map_err(|_| format!("invalid --port value: {value}"))?;
                i += 2;
            }
            "--dir" => {
                let value = args.get(i + 1).ok_or("--dir option requires an argument")?;
                opts.dir = Some(value.clone());
                i += 2;
            }
            "--dbfilename" => {
                let value = args.get(i + 1).ok_or("--dbfilename option requires an argument")?;
                opts.dbfilename = Some(value.clone());
                i += 2;
            }
            "--replicaof" => {
                let value = args.get(i + 1).ok_or("--replicaof requires a host and port (e.g. 'localhost 6379')")?;
                let parts: Vec<&str> = value.split_whitespace().collect();
                if parts.len() != 2 {
                    return Err("--replicaof requires a host and port (e.g. 'localhost 6379')".to_string());
                }
                let port: u16 = parts[1]
                    .parse()
                    .map_err(|_| format!("invalid --replicaof port: {}", parts[1]))?;
                opts.replica_of = Some((parts[0].to_string(), port));
                i += 2;
            }
            other => return Err(format!("'{other}' is an unknown option")),
        }
    }
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> impl Iterator<Item = String> {
        items.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn defaults_to_port_6379_with_no_args() {
        let opts = parse_args(args(&[])).unwrap();
        assert_eq!(opts.port, 6379);
        assert!(opts.replica_of.is_none());
    }

    #[test]
    fn parses_all_four_flags() {
        let opts = parse_args(args(&[
            "--port", "6380", "--replicaof", "localhost 6379", "--dir", "/tmp", "--dbfilename", "dump.rdb",
        ]))
        .unwrap();
        assert_eq!(opts.port, 6380);
        assert_eq!(opts.replica_of, Some(("localhost".to_string(), 6379)));
        assert_eq!(opts.rdb_path().as_deref(), Some("/tmp/dump.rdb"));
    }

    #[test]
    fn rejects_malformed_replicaof() {
        let err = parse_args(args(&["--replicaof", "localhost"])).unwrap_err();
        assert!(err.contains("--replicaof"));
    }

    #[test]
    fn rejects_unknown_flag() {
        let err = parse_args(args(&["--bogus", "x"])).unwrap_err();
        assert!(err.contains("unknown option"));
    }

    #[tokio::test]
    async fn config_map_roundtrips() {
        let cfg = Config::new();
        assert_eq!(cfg.get("dir").await, None);
        cfg.set("dir", "/data").await;
        assert_eq!(cfg.get("dir").await, Some("/data".to_string()));
    }
}
