use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::exec_pool::{shell_quote, RemoteExecutionPool};
use super::ports::{HostPortScanner, HostPorts};
use super::quadlet::{self, ContainerDescriptor};
use crate::error::Result;

/// Label carrying the owning project on every slot container.
pub const PROJECT_LABEL: &str = "cb.project";

/// `name owner` lines from `podman ps`; a missing label gives no owner.
fn parse_publishers(listing: &str) -> Vec<(&str, Option<&str>)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let owner = fields.next().filter(|o| *o != "<no value>");
            Some((name, owner))
        })
        .collect()
}

/// Activates and tears down slot containers on a host via systemd + Quadlet.
pub struct ContainerRuntime {
    pool: Arc<RemoteExecutionPool>,
    quadlet_dir: PathBuf,
    timeout: Duration,
}

impl ContainerRuntime {
    pub fn new(pool: Arc<RemoteExecutionPool>, quadlet_dir: &Path) -> Self {
        let timeout = pool.command_timeout();
        Self {
            pool,
            quadlet_dir: quadlet_dir.to_path_buf(),
            timeout,
        }
    }

    fn unit_path(&self, container: &str) -> String {
        self.quadlet_dir
            .join(format!("{container}.container"))
            .to_string_lossy()
            .to_string()
    }

    /// Write the rendered unit and (re)start the generated service.
    pub async fn start(&self, host: &str, descriptor: &ContainerDescriptor) -> Result<()> {
        let unit = quadlet::render(descriptor);
        self.pool
            .write_file(host, &self.unit_path(&descriptor.name), &unit, self.timeout)
            .await?;
        self.pool
            .exec_checked(host, "systemctl daemon-reload", self.timeout)
            .await?;
        let restart = format!("systemctl restart {}", shell_quote(&descriptor.service_name()));
        self.pool.exec_checked(host, &restart, self.timeout).await?;
        tracing::info!(host, container = %descriptor.name, port = descriptor.host_port, "container started");
        Ok(())
    }

    /// Stop the slot's service, drop its unit, and remove anything still publishing `port`.
    ///
    /// Containers on `port` labelled as another project's are left alone. Safe to call when
    /// nothing is running.
    pub async fn teardown(
        &self,
        host: &str,
        project: &str,
        container: &str,
        port: Option<u16>,
    ) -> Result<()> {
        let stop = format!(
            "systemctl stop {} || true",
            shell_quote(&format!("{container}.service"))
        );
        self.pool.exec_checked(host, &stop, self.timeout).await?;
        self.pool
            .remove_file(host, &self.unit_path(container), self.timeout)
            .await?;
        self.pool
            .exec_checked(host, "systemctl daemon-reload", self.timeout)
            .await?;

        let mut names = vec![container.to_string()];
        if let Some(port) = port {
            let listing = self
                .pool
                .exec_checked(
                    host,
                    &format!(
                        "podman ps -a --filter publish={port} --format '{{{{.Names}}}} {{{{index .Labels \"{PROJECT_LABEL}\"}}}}'"
                    ),
                    self.timeout,
                )
                .await?;
            for (name, owner) in parse_publishers(&listing.stdout) {
                if name == container {
                    continue;
                }
                match owner {
                    Some(owner) if owner != project => {
                        tracing::warn!(host, port, name, owner, "port held by another project, not removing");
                    }
                    _ => names.push(name.to_string()),
                }
            }
        }
        for name in names {
            let remove = format!("podman rm -f --ignore {}", shell_quote(&name));
            self.pool.exec_checked(host, &remove, self.timeout).await?;
        }
        tracing::info!(host, container, ?port, "container torn down");
        Ok(())
    }

    pub async fn host_ports(&self, host: &str) -> Result<HostPorts> {
        HostPortScanner::new(&self.pool, self.timeout).scan(host).await
    }
}
