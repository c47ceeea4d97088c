//! NetDB state persistence.
//!
//! One line per measured network:
//!
//! ```text
//! <network> <pings_sent> <pings_recv> <hops> <rtt> <next_ping_time> <last_use_time> [<hostname>]*
//! ```
//!
//! Times are whole unix seconds. Only entries that actually received
//! replies are worth keeping; reloaded entries are down-weighted so a
//! fresh measurement quickly outvotes stale history.

use super::{network_key, NetDb, NetdbEntry};
use hiero_api::{HieroError, HieroResult, Timestamp};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::task::AbortHandle;

impl NetDb {
    /// Write every measured entry to the configured file. Returns the
    /// number of entries written; a no-op when persistence is
    /// disabled.
    pub fn save_state(&self) -> HieroResult<usize> {
        if !self.config.persistence_enabled() {
            return Ok(0);
        }
        self.save_state_to(Path::new(&self.config.filename))
    }

    pub(crate) fn save_state_to(&self, path: &Path) -> HieroResult<usize> {
        let started = std::time::Instant::now();
        let mut out = std::io::BufWriter::new(
            std::fs::File::create(path).map_err(|e| {
                HieroError::other_src(
                    format!("creating {}", path.display()),
                    e,
                )
            })?,
        );

        let mut count = 0;
        {
            let inner = self.inner.lock().unwrap();
            for entry in inner.entries.values() {
                if entry.pings_recv == 0 {
                    continue;
                }
                write!(
                    out,
                    "{} {} {} {:10.5} {:10.5} {} {}",
                    entry.network,
                    entry.pings_sent,
                    entry.pings_recv,
                    entry.hops,
                    entry.rtt,
                    entry.next_ping_time.as_secs(),
                    entry.last_use_time.as_secs(),
                )
                .map_err(|e| HieroError::other_src("writing state", e))?;
                for host in &entry.hosts {
                    write!(out, " {host}").map_err(|e| {
                        HieroError::other_src("writing state", e)
                    })?;
                }
                writeln!(out)
                    .map_err(|e| HieroError::other_src("writing state", e))?;
                count += 1;
            }
        }

        out.flush()
            .map_err(|e| HieroError::other_src("flushing state", e))?;
        tracing::info!(
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "netdb state saved",
        );
        Ok(count)
    }

    /// Load previously saved state. Missing files and malformed lines
    /// are silently skipped; networks already present win over the
    /// file.
    pub fn reload_state(&self) -> usize {
        if !self.config.persistence_enabled() {
            return 0;
        }
        self.reload_state_from(Path::new(&self.config.filename))
    }

    pub(crate) fn reload_state_from(&self, path: &Path) -> usize {
        let started = std::time::Instant::now();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return 0,
        };

        let mut count = 0;
        let mut inner = self.inner.lock().unwrap();
        for line in content.lines() {
            let Some(entry) = parse_line(line) else { continue };
            let key = entry.network.clone();
            if inner.entries.contains_key(&key) {
                continue;
            }

            let mut entry = entry;
            let mut kept = Vec::with_capacity(entry.hosts.len());
            for host in entry.hosts.drain(..) {
                if inner.hosts.contains_key(&host) {
                    continue;
                }
                inner.hosts.insert(host.clone(), key.clone());
                kept.push(host);
            }
            entry.hosts = kept;
            inner.entries.insert(key, entry);
            count += 1;
        }
        drop(inner);

        tracing::info!(
            count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "netdb state reloaded",
        );
        count
    }
}

fn parse_line(line: &str) -> Option<NetdbEntry> {
    let mut fields = line.split_ascii_whitespace();

    let addr: IpAddr = fields.next()?.parse().ok()?;
    let mut entry = NetdbEntry::new(network_key(addr), Timestamp::now());

    entry.pings_sent = fields.next()?.parse().ok()?;
    entry.pings_recv = fields.next()?.parse().ok()?;
    if entry.pings_recv == 0 {
        return None;
    }

    // down-weight reloaded measurements
    entry.pings_sent = 1;
    entry.pings_recv = 1;

    entry.hops = fields.next()?.parse().ok()?;
    entry.rtt = fields.next()?.parse().ok()?;
    entry.next_ping_time =
        Timestamp::from_secs(fields.next()?.parse().ok()?);
    entry.last_use_time =
        Timestamp::from_secs(fields.next()?.parse().ok()?);

    entry.hosts = fields.map(str::to_string).collect();
    Some(entry)
}

/// Spawns a task that periodically saves the database state.
pub fn spawn_save_task(netdb: Arc<NetDb>) -> AbortHandle {
    let interval = netdb.config.save_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = netdb.save_state() {
                tracing::warn!(?err, "periodic netdb save failed");
            }
        }
    })
    .abort_handle()
}
