use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::exec_pool::{shell_quote, RemoteExecutionPool};
use crate::error::{OrchestratorError, Result};
use crate::models::{Environment, RegistryKey, SlotColor};

/// Proof that live traffic was switched to `port` by a validated reload.
///
/// Only [`ReverseProxyConfigurator::apply`] can create one, and
/// [`SlotRegistry::activate`](crate::models::SlotRegistry::activate) requires it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ProxyActivation {
    unit: String,
    port: u16,
}

impl ProxyActivation {
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    #[cfg(test)]
    pub(crate) fn for_tests(port: u16) -> Self {
        Self {
            unit: "test".into(),
            port,
        }
    }
}

/// Slot that a routing unit should point at.
#[derive(Debug, Clone, Copy)]
pub struct RouteTarget<'a> {
    pub slot: SlotColor,
    pub port: u16,
    pub version: &'a str,
}

pub fn site_address(key: &RegistryKey, base_domain: &str) -> String {
    match key.environment {
        Environment::Production => format!("{}.{base_domain}", key.project),
        _ => format!("{}.{base_domain}", key.scope()),
    }
}

/// Routing unit for one project-environment. Always regenerated whole.
pub fn render_site(key: &RegistryKey, address: &str, target: &RouteTarget<'_>) -> String {
    // The header is a comment; a control character in it would start a new directive.
    let version: String = target.version.chars().filter(|c| !c.is_control()).collect();
    format!(
        "# cb: {} -> {} {version}\n{address} {{\n    encode gzip\n    reverse_proxy 127.0.0.1:{}\n}}\n",
        key.scope(),
        target.slot,
        target.port
    )
}

pub struct ReverseProxyConfigurator {
    pool: Arc<RemoteExecutionPool>,
    sites_dir: PathBuf,
    main_config: PathBuf,
    base_domain: String,
    timeout: Duration,
}

impl ReverseProxyConfigurator {
    pub fn new(
        pool: Arc<RemoteExecutionPool>,
        sites_dir: &Path,
        main_config: &Path,
        base_domain: &str,
    ) -> Self {
        let timeout = pool.command_timeout();
        Self {
            pool,
            sites_dir: sites_dir.to_path_buf(),
            main_config: main_config.to_path_buf(),
            base_domain: base_domain.to_string(),
            timeout,
        }
    }

    pub fn unit_path(&self, key: &RegistryKey) -> String {
        self.sites_dir
            .join(format!("{}.caddy", key.scope()))
            .to_string_lossy()
            .to_string()
    }

    fn caddy_command(&self, action: &str) -> String {
        format!(
            "caddy {action} --config {} --adapter caddyfile",
            shell_quote(&self.main_config.to_string_lossy())
        )
    }

    /// Run the proxy's own validator over the full configuration.
    pub async fn validate(&self, host: &str) -> Result<bool> {
        let output = self
            .pool
            .exec(host, &self.caddy_command("validate"), self.timeout)
            .await?;
        Ok(output.success())
    }

    async fn restore(&self, host: &str, path: &str, previous: Option<&str>) {
        let result = match previous {
            Some(content) => self.pool.write_file(host, path, content, self.timeout).await,
            None => self.pool.remove_file(host, path, self.timeout).await,
        };
        if let Err(e) = result {
            tracing::error!(host, path, error = %e, "failed to restore previous proxy unit");
        }
    }

    /// Point `key`'s routing unit at `target` and reload the live proxy.
    ///
    /// The live proxy is only signalled after validation passes; on any failure the previous
    /// unit is put back.
    pub async fn apply(
        &self,
        host: &str,
        key: &RegistryKey,
        target: &RouteTarget<'_>,
    ) -> Result<ProxyActivation> {
        let unit = key.scope();
        let path = self.unit_path(key);
        let content = render_site(key, &site_address(key, &self.base_domain), target);

        let previous = self.pool.read_file(host, &path, self.timeout).await?;
        self.pool
            .write_file(host, &path, &content, self.timeout)
            .await?;

        let validation = self
            .pool
            .exec(host, &self.caddy_command("validate"), self.timeout)
            .await;
        match validation {
            Ok(output) if output.success() => {}
            Ok(output) => {
                self.restore(host, &path, previous.as_deref()).await;
                return Err(OrchestratorError::ConfigInvalid {
                    unit,
                    reason: first_line(&output.stderr, &output.stdout),
                });
            }
            Err(e) => {
                self.restore(host, &path, previous.as_deref()).await;
                return Err(e);
            }
        }

        let reload = self
            .pool
            .exec(host, &self.caddy_command("reload"), self.timeout)
            .await;
        let failure = match reload {
            Ok(output) if output.success() => None,
            Ok(output) => Some(first_line(&output.stderr, &output.stdout)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            self.restore(host, &path, previous.as_deref()).await;
            return Err(OrchestratorError::ProxyReloadFailed {
                unit,
                port: target.port,
                reason,
            });
        }

        tracing::info!(host, unit = %unit, slot = %target.slot, port = target.port, "proxy switched");
        Ok(ProxyActivation {
            unit,
            port: target.port,
        })
    }
}

fn first_line(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_uses_bare_project_domain() {
        let prod = RegistryKey::new("demo", Environment::Production).unwrap();
        let staging = RegistryKey::new("demo", Environment::Staging).unwrap();
        assert_eq!(site_address(&prod, "apps.example.com"), "demo.apps.example.com");
        assert_eq!(
            site_address(&staging, "apps.example.com"),
            "demo-staging.apps.example.com"
        );
    }

    #[test]
    fn site_declares_single_upstream() {
        let key = RegistryKey::new("demo", Environment::Production).unwrap();
        let target = RouteTarget {
            slot: SlotColor::Blue,
            port: 4000,
            version: "v1",
        };
        let site = render_site(&key, "demo.apps.example.com", &target);
        assert_eq!(site.matches("reverse_proxy").count(), 1);
        insta::assert_snapshot!(site, @r###"
        # cb: demo-production -> blue v1
        demo.apps.example.com {
            encode gzip
            reverse_proxy 127.0.0.1:4000
        }
        "###);
    }

    #[test]
    fn header_comment_cannot_break_out() {
        let key = RegistryKey::new("demo", Environment::Production).unwrap();
        let target = RouteTarget {
            slot: SlotColor::Green,
            port: 4001,
            version: "v2\n}\nevil.example.com {",
        };
        let site = render_site(&key, "demo.apps.example.com", &target);
        assert_eq!(site.lines().count(), 5);
        assert!(site.starts_with("# cb: demo-production -> green v2}evil.example.com {\n"));
        assert_eq!(site.matches("reverse_proxy").count(), 1);
    }

    #[test]
    fn first_line_prefers_stderr() {
        assert_eq!(first_line("\nError: bad\nmore", "ok"), "Error: bad");
        assert_eq!(first_line("  ", "adapted config"), "adapted config");
        assert_eq!(first_line("", ""), "no output");
    }
}
