//! Egress guardrails
//!
//! URL and destination vetting applied before any wire request:
//! scheme allow-list, host allow/deny lists, and private-network
//! blocking evaluated against resolved IPs rather than hostname strings.
//!
//! Resolution happens once, inside a custom `reqwest` DNS resolver, and
//! the connection is made to exactly the vetted addresses. A hostname
//! that re-resolves somewhere else later never reaches the socket layer
//! with the old vetting (DNS-rebinding resistance). Literal-IP URLs and
//! redirect hops are vetted directly.

use super::metrics::HttpMetrics;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use url::Url;
use webscan_core::{HttpConfig, ScanError};

/// Whether an address belongs to a range we refuse to touch when
/// private-network blocking is on.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || is_shared_v4(v4)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local_v6(v6)
                || is_link_local_v6(v6)
                || is_v4_mapped_blocked(v6)
        }
    }
}

/// 100.64.0.0/10, carrier-grade NAT
fn is_shared_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (octets[1] & 0xc0) == 64
}

/// fc00::/7
fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// ::ffff:10.0.0.1 and friends must not slip through as v6
fn is_v4_mapped_blocked(ip: Ipv6Addr) -> bool {
    ip.to_ipv4_mapped()
        .map(|v4| is_blocked_ip(IpAddr::V4(v4)))
        .unwrap_or(false)
}

/// Host-level policy: scheme, allow/deny lists, private ranges.
#[derive(Debug, Clone)]
pub struct Guardrails {
    allowed_hosts: Vec<String>,
    blocked_hosts: Vec<String>,
    block_private_networks: bool,
}

impl Guardrails {
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            allowed_hosts: lowercased(&config.allowed_hosts),
            blocked_hosts: lowercased(&config.blocked_hosts),
            block_private_networks: config.block_private_networks,
        }
    }

    /// Vet a URL before the request pipeline runs.
    ///
    /// Hostname-level checks happen here; resolved-IP checks happen in
    /// [`GuardedResolver`] at connect time.
    pub fn check_url(&self, url: &Url) -> Result<(), ScanError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ScanError::egress_blocked(format!(
                    "scheme '{}' is not allowed",
                    other
                )))
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| ScanError::egress_blocked("URL has no host"))?;

        self.check_host(host)?;

        // Literal IPs never hit the resolver, vet them here
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            if self.block_private_networks && is_blocked_ip(ip) {
                return Err(ScanError::egress_blocked(format!(
                    "address {} is in a blocked range",
                    ip
                )));
            }
        }
        Ok(())
    }

    /// Hostname list checks, shared by URL vetting and the resolver.
    pub fn check_host(&self, host: &str) -> Result<(), ScanError> {
        let host = host.to_ascii_lowercase();
        if self.blocked_hosts.iter().any(|b| *b == host) {
            return Err(ScanError::egress_blocked(format!(
                "host {} is on the blocklist",
                host
            )));
        }
        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.iter().any(|a| *a == host) {
            return Err(ScanError::egress_blocked(format!(
                "host {} is not on the allowlist",
                host
            )));
        }
        Ok(())
    }

    pub fn block_private_networks(&self) -> bool {
        self.block_private_networks
    }
}

fn lowercased(hosts: &[String]) -> Vec<String> {
    hosts.iter().map(|h| h.to_ascii_lowercase()).collect()
}

/// DNS resolver that filters out disallowed destinations.
///
/// Installed on the shared client so every connection — including ones
/// made while following redirects — goes through the same vetting.
pub struct GuardedResolver {
    guardrails: Guardrails,
    metrics: Arc<HttpMetrics>,
}

impl GuardedResolver {
    pub fn new(guardrails: Guardrails, metrics: Arc<HttpMetrics>) -> Self {
        Self { guardrails, metrics }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let guardrails = self.guardrails.clone();
        let metrics = Arc::clone(&self.metrics);
        Box::pin(async move {
            let host = name.as_str().to_string();

            if let Err(e) = guardrails.check_host(&host) {
                HttpMetrics::inc(&metrics.egress_blocks);
                return Err(boxed_err(e.to_string()));
            }

            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| boxed_err(format!("resolve {}: {}", host, e)))?
                .collect();

            let vetted: Vec<SocketAddr> = if guardrails.block_private_networks() {
                resolved
                    .into_iter()
                    .filter(|addr| !is_blocked_ip(addr.ip()))
                    .collect()
            } else {
                resolved
            };

            if vetted.is_empty() {
                HttpMetrics::inc(&metrics.egress_blocks);
                return Err(boxed_err(format!(
                    "egress_blocked: all addresses for {} are in blocked ranges",
                    host
                )));
            }

            let addrs: Addrs = Box::new(vetted.into_iter());
            Ok(addrs)
        })
    }
}

fn boxed_err(msg: String) -> Box<dyn std::error::Error + Send + Sync> {
    msg.into()
}
