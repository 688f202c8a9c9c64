//! Connection side-channel
//!
//! Each worker writes `{dir}/{worker_id}.txt`, one `ip,port,pid` line per
//! client (port and pid optional). Missing files, unreadable files and
//! malformed lines all read as "no connection".

use crate::models::{ConnectionRecord, ConnectionSet};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Parse one line, `None` when malformed
pub fn parse_connection_line(line: &str) -> Option<ConnectionRecord> {
    let mut fields = line.trim().split(',').map(str::trim);

    let ip = fields.next().filter(|f| !f.is_empty())?;
    ip.parse::<IpAddr>().ok()?;

    let client_port = match fields.next() {
        None | Some("") => None,
        Some(port) => Some(port.parse::<u16>().ok()?),
    };
    let client_pid = match fields.next() {
        None | Some("") => None,
        Some(pid) => Some(pid.parse::<u32>().ok()?),
    };
    if fields.next().is_some() {
        return None;
    }

    Some(ConnectionRecord {
        client_ip: ip.to_string(),
        client_port,
        client_pid,
    })
}

/// Parse a whole file; malformed lines are skipped
pub fn parse_connections(content: &str) -> ConnectionSet {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_connection_line)
        .collect()
}

/// Restartable reader over the connections directory
#[derive(Debug, Clone, Default)]
pub struct ConnectionReader {
    dir: Option<PathBuf>,
}

impl ConnectionReader {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn file_for(&self, worker_id: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let safe = !worker_id.is_empty()
            && !worker_id.contains(|c: char| c == '/' || c == '\\')
            && worker_id != "."
            && worker_id != "..";
        safe.then(|| dir.join(format!("{}.txt", worker_id)))
    }

    /// Current connections of one worker
    pub async fn read_worker(&self, worker_id: &str) -> ConnectionSet {
        let Some(path) = self.file_for(worker_id) else {
            return ConnectionSet::new();
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_connections(&content),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Connection file unreadable");
                }
                ConnectionSet::new()
            }
        }
    }

    /// Snapshot for a set of workers
    pub async fn read_all<'a, I>(&self, worker_ids: I) -> HashMap<String, ConnectionSet>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashMap::new();
        for worker_id in worker_ids {
            out.insert(worker_id.to_string(), self.read_worker(worker_id).await);
        }
        out
    }
}
