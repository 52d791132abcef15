//! ICE server descriptor parsing and wildcard host rewriting.
//!
//! Descriptors look like `scheme:[user[:password]@]host[:port][?query]`.
//! A `0.0.0.0` host is replaced by the local interface address sharing a
//! subnet with the connecting client, so a server bound to every interface
//! can still be advertised with a reachable address.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, warn};

pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Parsed ICE server: url without credentials, plus the credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerDescriptor {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// One entry of the `iceServers` response.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl From<IceServerDescriptor> for IceServerEntry {
    fn from(d: IceServerDescriptor) -> Self {
        Self {
            urls: vec![d.url],
            username: d.username,
            credential: d.credential,
        }
    }
}

/// `{ "iceServers": [ ... ] }`; no servers is an empty list.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServersResponse {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServerEntry>,
}

/// An IPv4 address bound to a local interface, with its netmask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceAddr {
    pub fn shares_subnet_with(&self, other: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.addr) & mask == u32::from(other) & mask
    }
}

/// Read-only view of the host's network configuration.
pub trait HostInterfaces: Send + Sync {
    fn ipv4_interfaces(&self) -> Vec<InterfaceAddr>;
}

/// Interfaces reported by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl HostInterfaces for SystemInterfaces {
    #[cfg(unix)]
    fn ipv4_interfaces(&self) -> Vec<InterfaceAddr> {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("getifaddrs failed: {}", e);
                return Vec::new();
            }
        };
        addrs
            .filter_map(|ifa| {
                let addr = ifa.address.as_ref()?.as_sockaddr_in()?.ip();
                let netmask = ifa.netmask.as_ref()?.as_sockaddr_in()?.ip();
                Some(InterfaceAddr {
                    name: ifa.interface_name.clone(),
                    addr: Ipv4Addr::from(addr),
                    netmask: Ipv4Addr::from(netmask),
                })
            })
            .collect()
    }

    #[cfg(not(unix))]
    fn ipv4_interfaces(&self) -> Vec<InterfaceAddr> {
        Vec::new()
    }
}

/// Fixed interface list, for hosts whose configuration is known up front.
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces(pub Vec<InterfaceAddr>);

impl HostInterfaces for StaticInterfaces {
    fn ipv4_interfaces(&self) -> Vec<InterfaceAddr> {
        self.0.clone()
    }
}

#[derive(Clone)]
pub struct IceServerResolver {
    interfaces: Arc<dyn HostInterfaces>,
}

impl Default for IceServerResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemInterfaces))
    }
}

impl IceServerResolver {
    pub fn new(interfaces: Arc<dyn HostInterfaces>) -> Self {
        Self { interfaces }
    }

    /// Parses `descriptor`, rewriting a wildcard host relative to `client`.
    /// Never fails: a descriptor without `:` comes back as its own url.
    pub fn resolve(&self, descriptor: &str, client: Option<IpAddr>) -> IceServerDescriptor {
        let Some((scheme, remainder)) = descriptor.split_once(':') else {
            return IceServerDescriptor {
                url: descriptor.to_string(),
                username: None,
                credential: None,
            };
        };

        let (credentials, host_port) = match remainder.split_once('@') {
            Some((creds, rest)) => (Some(creds), rest),
            None => (None, remainder),
        };

        let (username, credential) = match credentials {
            Some(creds) => match creds.split_once(':') {
                Some((user, pass)) => (non_empty(user), non_empty(pass)),
                None => (non_empty(creds), None),
            },
            None => (None, None),
        };

        let host_end = host_port.find([':', '?']).unwrap_or(host_port.len());
        let (host, tail) = host_port.split_at(host_end);

        let host = match client {
            Some(client) if host == WILDCARD_HOST => match self.local_address_for(client) {
                Some(local) => {
                    debug!("ICE host {} -> {} for client {}", host, local, client);
                    local.to_string()
                }
                None => {
                    debug!("no interface shares a subnet with {}, keeping wildcard", client);
                    host.to_string()
                }
            },
            _ => host.to_string(),
        };

        IceServerDescriptor {
            url: format!("{scheme}:{host}{tail}"),
            username,
            credential,
        }
    }

    pub fn resolve_all<'a, I>(&self, descriptors: I, client: Option<IpAddr>) -> Vec<IceServerDescriptor>
    where
        I: IntoIterator<Item = &'a String>,
    {
        descriptors
            .into_iter()
            .map(|d| self.resolve(d, client))
            .collect()
    }

    /// Builds the `iceServers` record handed to a connecting client.
    pub fn response<'a, I>(&self, descriptors: I, client: Option<IpAddr>) -> IceServersResponse
    where
        I: IntoIterator<Item = &'a String>,
    {
        IceServersResponse {
            ice_servers: self
                .resolve_all(descriptors, client)
                .into_iter()
                .map(IceServerEntry::from)
                .collect(),
        }
    }

    fn local_address_for(&self, client: IpAddr) -> Option<Ipv4Addr> {
        let client = match client {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
        };
        self.interfaces
            .ipv4_interfaces()
            .into_iter()
            .find(|ifa| ifa.shares_subnet_with(client))
            .map(|ifa| ifa.addr)
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
