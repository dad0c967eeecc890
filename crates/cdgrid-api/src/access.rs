//! Origin-based access control for administrative routes.
//!
//! The client address is the first `X-Forwarded-For` entry when the header
//! is present, otherwise the socket peer. It is admitted when it falls in
//! one of the configured networks.

use std::net::{IpAddr, SocketAddr};

use axum::extract::connect_info::MockConnectInfo;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ApiState;
use crate::handlers::error_body;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("invalid network '{0}': expected address/prefix")]
    InvalidNetwork(String),
}

/// Parse `address/prefix`. A bare address is a single-host network.
pub fn parse_network(raw: &str) -> Result<IpNetwork, AccessError> {
    let invalid = || AccessError::InvalidNetwork(raw.to_string());
    let s = raw.trim();
    if s.contains('/') {
        s.parse::<IpNetwork>().map_err(|_| invalid())
    } else {
        s.parse::<IpAddr>().map(IpNetwork::from).map_err(|_| invalid())
    }
}

fn within(net: &IpNetwork, ip: IpAddr) -> bool {
    net.contains(normalize(ip))
}

/// Dual-stack sockets report IPv4 peers as `::ffff:a.b.c.d`.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// `[access]` configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Networks allowed to manage the registry and read load.
    pub trusted_networks: Vec<String>,
    /// Networks additionally allowed to read load.
    pub monitoring_networks: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            trusted_networks: vec![
                "127.0.0.0/8".into(),
                "::1/128".into(),
                "172.16.0.0/12".into(),
            ],
            monitoring_networks: Vec::new(),
        }
    }
}

/// Parsed network lists.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    trusted: Vec<IpNetwork>,
    monitoring: Vec<IpNetwork>,
}

impl AccessPolicy {
    pub fn from_config(config: &AccessConfig) -> Result<Self, AccessError> {
        let parse = |nets: &[String]| nets.iter().map(|n| parse_network(n)).collect::<Result<Vec<_>, _>>();
        Ok(Self {
            trusted: parse(&config.trusted_networks)?,
            monitoring: parse(&config.monitoring_networks)?,
        })
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted.iter().any(|net| within(net, ip))
    }

    /// Trusted or monitoring origin.
    pub fn may_monitor(&self, ip: IpAddr) -> bool {
        self.is_trusted(ip) || self.monitoring.iter().any(|net| within(net, ip))
    }
}

/// Resolve the client address. `None` if no usable address is known.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    match headers.get("x-forwarded-for") {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok()),
        None => peer.map(|addr| addr.ip()),
    }
}

fn peer_addr(req: &Request) -> Option<SocketAddr> {
    let extensions = req.extensions();
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .or_else(|| extensions.get::<MockConnectInfo<SocketAddr>>().map(|info| info.0))
}

fn admit(req: &Request, policy: &AccessPolicy, check: fn(&AccessPolicy, IpAddr) -> bool) -> bool {
    let ip = client_ip(req.headers(), peer_addr(req));
    match ip {
        Some(ip) if check(policy, ip) => {
            debug!(client = %ip, path = %req.uri().path(), "origin admitted");
            true
        }
        _ => {
            warn!(client = ?ip, path = %req.uri().path(), "origin denied");
            false
        }
    }
}

fn denied() -> Response {
    error_body(StatusCode::FORBIDDEN, "access denied")
}

/// Middleware for trusted-only routes.
pub async fn require_trusted(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    if admit(&req, &state.access, AccessPolicy::is_trusted) {
        next.run(req).await
    } else {
        denied()
    }
}

/// Middleware for routes open to trusted and monitoring origins.
pub async fn require_monitoring(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Response {
    if admit(&req, &state.access, AccessPolicy::may_monitor) {
        next.run(req).await
    } else {
        denied()
    }
}
