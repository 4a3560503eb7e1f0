//! Host routing-table integration
//!
//! Every block acquired by this node is announced through a route in a
//! dedicated kernel routing table. Installation either succeeds or fails as
//! a whole; there is no rollback call.

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, trace};

/// Routing table used for block routes.
pub const DEFAULT_TABLE_ID: u32 = 119;

/// Protocol number tagging routes installed by this agent.
pub const DEFAULT_PROTOCOL_ID: u8 = 30;

/// Route installation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RouteError(pub String);

/// Installs the route for a newly acquired block
#[async_trait]
pub trait RouteInstaller: Send + Sync {
    async fn install_route(&self, block: &IpNet) -> Result<(), RouteError>;
}

/// Installs block routes with the `ip` command
///
/// Routes are `unreachable` entries in a private table: they exist to be
/// exported to the routing daemon, not to forward traffic locally.
#[derive(Debug, Clone)]
pub struct IpRouteInstaller {
    ip_path: String,
    table_id: u32,
    protocol_id: u8,
}

impl IpRouteInstaller {
    pub fn new(table_id: u32, protocol_id: u8) -> Self {
        Self::with_path("ip".to_string(), table_id, protocol_id)
    }

    pub fn with_path(ip_path: String, table_id: u32, protocol_id: u8) -> Self {
        Self {
            ip_path,
            table_id,
            protocol_id,
        }
    }

    fn route_args(&self, block: &IpNet) -> Vec<String> {
        let family = match block {
            IpNet::V4(_) => "-4",
            IpNet::V6(_) => "-6",
        };
        vec![
            family.to_string(),
            "route".to_string(),
            "replace".to_string(),
            "unreachable".to_string(),
            block.to_string(),
            "table".to_string(),
            self.table_id.to_string(),
            "proto".to_string(),
            self.protocol_id.to_string(),
        ]
    }
}

#[async_trait]
impl RouteInstaller for IpRouteInstaller {
    #[instrument(skip(self))]
    async fn install_route(&self, block: &IpNet) -> Result<(), RouteError> {
        let args = self.route_args(block);
        trace!(cmd = %self.ip_path, args = ?args, "Executing command");

        let output = Command::new(&self.ip_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| RouteError(format!("failed to execute {}: {}", self.ip_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RouteError(format!(
                "{} {} failed: {}",
                self.ip_path,
                args.join(" "),
                stderr.trim()
            )));
        }

        debug!(block = %block, table = self.table_id, "Installed block route");
        Ok(())
    }
}

/// Accepts every route without touching the host
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRouteInstaller;

#[async_trait]
impl RouteInstaller for NoopRouteInstaller {
    async fn install_route(&self, _block: &IpNet) -> Result<(), RouteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_args() {
        let installer = IpRouteInstaller::new(DEFAULT_TABLE_ID, DEFAULT_PROTOCOL_ID);
        let block: IpNet = "10.64.0.0/27".parse().unwrap();
        assert_eq!(
            installer.route_args(&block).join(" "),
            "-4 route replace unreachable 10.64.0.0/27 table 119 proto 30"
        );

        let block: IpNet = "fd00::/120".parse().unwrap();
        assert!(installer.route_args(&block)[0] == "-6");
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let installer = IpRouteInstaller::with_path(
            "/nonexistent/ip".to_string(),
            DEFAULT_TABLE_ID,
            DEFAULT_PROTOCOL_ID,
        );
        let block: IpNet = "10.64.0.0/27".parse().unwrap();
        assert!(installer.install_route(&block).await.is_err());
    }

    #[tokio::test]
    async fn test_noop_installer() {
        let block: IpNet = "10.64.0.0/27".parse().unwrap();
        assert!(NoopRouteInstaller.install_route(&block).await.is_ok());
    }
}
