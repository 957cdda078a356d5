use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::exec_pool::RemoteExecutionPool;
use crate::error::{OrchestratorError, Result};
use crate::models::PortRange;

/// `0.0.0.0:4100->3000/tcp` and `[::]:4100->3000/tcp` publish mappings from `podman ps`.
static PUBLISHED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":(\d+)->\d+").unwrap());

/// Local address column of `ss -tlnH`, e.g. `0.0.0.0:22` or `[::]:443`.
static LISTEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+\s+\d+\s+\d+\s+\S*:(\d+)\s").unwrap());

pub struct PortAllocator;

impl PortAllocator {
    /// Lowest port in `range` not present in `claimed`.
    pub fn lowest_free(range: PortRange, claimed: &HashSet<u16>) -> Result<u16> {
        (range.start..=range.end)
            .find(|p| !claimed.contains(p))
            .ok_or_else(|| {
                OrchestratorError::PortAllocation(format!(
                    "no free port in {}-{} ({} claimed)",
                    range.start,
                    range.end,
                    claimed.len()
                ))
            })
    }
}

pub fn parse_published_ports(output: &str) -> HashSet<u16> {
    PUBLISHED_RE
        .captures_iter(output)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

pub fn parse_listening_ports(output: &str) -> HashSet<u16> {
    output
        .lines()
        .filter_map(|line| LISTEN_RE.captures(line))
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Live view of which ports are taken on a host.
#[derive(Debug, Default, Clone)]
pub struct HostPorts {
    pub published: HashSet<u16>,
    pub listening: HashSet<u16>,
}

impl HostPorts {
    pub fn contains(&self, port: u16) -> bool {
        self.published.contains(&port) || self.listening.contains(&port)
    }
}

pub struct HostPortScanner<'a> {
    pool: &'a RemoteExecutionPool,
    timeout: Duration,
}

impl<'a> HostPortScanner<'a> {
    pub fn new(pool: &'a RemoteExecutionPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub async fn scan(&self, host: &str) -> Result<HostPorts> {
        let containers = self
            .pool
            .exec_checked(host, "podman ps -a --format '{{.Ports}}'", self.timeout)
            .await?;
        let sockets = self.pool.exec_checked(host, "ss -tlnH", self.timeout).await?;
        Ok(HostPorts {
            published: parse_published_ports(&containers.stdout),
            listening: parse_listening_ports(&sockets.stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_skips_claimed() {
        let claimed: HashSet<u16> = [4000, 4001, 4003].into_iter().collect();
        let port = PortAllocator::lowest_free(PortRange::new(4000, 4010), &claimed).unwrap();
        assert_eq!(port, 4002);
    }

    #[test]
    fn exhausted_range_fails() {
        let claimed: HashSet<u16> = [5000, 5001].into_iter().collect();
        assert!(matches!(
            PortAllocator::lowest_free(PortRange::new(5000, 5001), &claimed),
            Err(OrchestratorError::PortAllocation(_))
        ));
    }

    #[test]
    fn parse_podman_ports() {
        let out = "0.0.0.0:4000->3000/tcp\n\n[::]:4002->3000/tcp, 0.0.0.0:4002->3000/tcp\n";
        let ports = parse_published_ports(out);
        assert_eq!(ports, [4000, 4002].into_iter().collect());
    }

    #[test]
    fn parse_ss_output() {
        let out = "LISTEN 0      4096         0.0.0.0:22        0.0.0.0:*\n\
                   LISTEN 0      511        127.0.0.1:4001      0.0.0.0:*\n\
                   LISTEN 0      4096            [::]:443          [::]:*\n";
        let ports = parse_listening_ports(out);
        assert_eq!(ports, [22, 4001, 443].into_iter().collect());
    }
}
