//! Floating address managed as an alias on a local interface.

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use warden_core::{configurator::NetworkConfigurator, Result, WardenError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("invalid ip address '{0}'")]
    InvalidIp(String),

    #[error("invalid prefix length '{0}'")]
    InvalidPrefix(String),
}

/// An address with its prefix length, e.g. `10.0.0.100/24`.
///
/// A missing prefix means a host address: /32 for IPv4, /128 for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    pub ip: IpAddr,
    pub prefix: u8,
}

impl InterfaceAddress {
    fn max_prefix(ip: &IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl FromStr for InterfaceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| AddressParseError::InvalidIp(ip.to_string()))?;
        let max = Self::max_prefix(&ip);
        let prefix = match prefix {
            None => max,
            Some(p) => match p.parse::<u8>() {
                Ok(p) if p <= max => p,
                _ => return Err(AddressParseError::InvalidPrefix(p.to_string())),
            },
        };
        Ok(Self { ip, prefix })
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

/// Extracts the addresses from `ip -o addr show` output.
pub fn parse_addresses(output: &str) -> Vec<InterfaceAddress> {
    let mut addresses = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" || field == "inet6" {
                if let Some(address) = fields.next().and_then(|a| a.parse().ok()) {
                    addresses.push(address);
                }
            }
        }
    }
    addresses
}

/// Manages one address on one interface with the `ip` command.
///
/// After a successful add, a gratuitous ARP is sent with `arping -U` so that
/// switches and neighbours learn the new owner. A failed announcement is
/// logged and the address is kept.
#[derive(Debug, Clone)]
pub struct AliasConfigurator {
    iface: String,
    address: InterfaceAddress,
}

impl AliasConfigurator {
    /// Parses `address` and checks that `iface` exists.
    pub async fn new(address: &str, iface: &str) -> Result<Self> {
        let parsed: InterfaceAddress = address.parse().map_err(|e| {
            WardenError::network(format!("could not parse address '{}': {}", address, e))
        })?;
        let configurator = Self::with_address(parsed, iface);
        run("ip", &["-o", "link", "show", "dev", iface])
            .await
            .map_err(|e| {
                WardenError::network(format!("could not get link for interface '{}': {}", iface, e))
            })?;
        Ok(configurator)
    }

    pub fn with_address(address: InterfaceAddress, iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            address,
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn address(&self) -> InterfaceAddress {
        self.address
    }

    async fn announce(&self) -> Result<()> {
        let ip = self.address.ip.to_string();
        match self.address.ip {
            IpAddr::V4(_) => run("arping", &["-U", "-c", "1", "-I", &self.iface, &ip]).await.map(|_| ()),
            // Neighbour discovery takes care of IPv6
            IpAddr::V6(_) => Ok(()),
        }
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "running command");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(WardenError::network(format!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl NetworkConfigurator for AliasConfigurator {
    async fn add_ip(&self) -> Result<()> {
        if self.is_set().await? {
            return Ok(());
        }

        let address = self.address.to_string();
        run("ip", &["addr", "add", &address, "dev", &self.iface])
            .await
            .map_err(|e| WardenError::network(format!("could not add ip: {}", e)))?;
        info!(address = %address, iface = %self.iface, "added floating address");

        if let Err(e) = self.announce().await {
            warn!(address = %address, iface = %self.iface, error = %e, "gratuitous arp failed");
        }
        Ok(())
    }

    async fn delete_ip(&self) -> Result<()> {
        if !self.is_set().await? {
            return Ok(());
        }

        let address = self.address.to_string();
        run("ip", &["addr", "del", &address, "dev", &self.iface])
            .await
            .map_err(|e| WardenError::network(format!("could not delete ip: {}", e)))?;
        info!(address = %address, iface = %self.iface, "deleted floating address");
        Ok(())
    }

    async fn is_set(&self) -> Result<bool> {
        let output = run("ip", &["-o", "addr", "show", "dev", &self.iface])
            .await
            .map_err(|e| WardenError::network(format!("could not list addresses: {}", e)))?;
        Ok(parse_addresses(&output).contains(&self.address))
    }
}
