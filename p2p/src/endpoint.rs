//! Transport addresses.
//!
//! An [`Endpoint`] names a listening point or dial target for one transport
//! protocol. Endpoints with an IP are *networked* and may be shared with any
//! peer; endpoints without one are *local* and only make sense to peers using
//! the same protocol (e.g. an in-process memory hub).
//!
//! Text form:
//!
//! ```text
//! tcp://10.0.0.1:26656          networked
//! tcp://[::1]:26656/mconn       networked, with path
//! memory:node-a                 local
//! ```

use {
    crate::error::P2pError,
    serde::{Deserialize, Serialize},
    std::{
        fmt,
        net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
        str::FromStr,
    },
};

/// Address of a transport listening point or dial target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Selects the transport handling this address.
    pub protocol: String,
    /// Transport-defined path.
    pub path: Option<String>,
    /// IP address; its presence marks the endpoint as networked.
    pub ip: Option<IpAddr>,
    /// Port, only meaningful together with `ip`.
    pub port: Option<u16>,
}

impl Endpoint {
    /// A networked endpoint for `protocol` at `addr`.
    pub fn networked(protocol: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            protocol: protocol.into(),
            path: None,
            ip: Some(addr.ip()),
            port: Some(addr.port()),
        }
    }

    /// A local endpoint for `protocol` identified by `path`.
    pub fn local(protocol: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            path: Some(path.into()),
            ip: None,
            port: None,
        }
    }

    /// Whether the endpoint carries an IP address.
    pub fn is_networked(&self) -> bool {
        self.ip.is_some()
    }

    /// The socket address, if networked. A missing port maps to 0.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip
            .map(|ip| SocketAddr::new(ip, self.port.unwrap_or_default()))
    }

    /// Check the endpoint is usable.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.protocol.is_empty() {
            return Err(P2pError::InvalidEndpoint("empty protocol".into()));
        }
        if self.port.is_some() && self.ip.is_none() {
            return Err(P2pError::InvalidEndpoint(format!(
                "{self}: port without IP"
            )));
        }
        if !self.is_networked() && self.path.as_deref().map_or(true, str::is_empty) {
            return Err(P2pError::InvalidEndpoint(format!(
                "{}: local endpoint needs a path",
                self.protocol
            )));
        }
        Ok(())
    }

    /// Replace a wildcard IP with `external`, or with the loopback address of
    /// the same family when no external address is known. Other endpoints are
    /// returned unchanged.
    pub fn resolve_unspecified(&self, external: Option<IpAddr>) -> Self {
        match self.ip {
            Some(ip) if ip.is_unspecified() => {
                let resolved = external.unwrap_or(match ip {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                });
                Self {
                    ip: Some(resolved),
                    ..self.clone()
                }
            }
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => {
                write!(f, "{}://{}", self.protocol, addr)?;
                if let Some(path) = &self.path {
                    write!(f, "/{}", path.trim_start_matches('/'))?;
                }
                Ok(())
            }
            None => write!(
                f,
                "{}:{}",
                self.protocol,
                self.path.as_deref().unwrap_or_default()
            ),
        }
    }
}

impl FromStr for Endpoint {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let endpoint = if let Some((protocol, rest)) = s.split_once("://") {
            let (host, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], Some(&rest[idx..])),
                None => (rest, None),
            };
            let addr: SocketAddr = host
                .parse()
                .map_err(|e| P2pError::InvalidEndpoint(format!("{s}: {e}")))?;
            let mut endpoint = Self::networked(protocol, addr);
            endpoint.path = path
                .map(|p| p.trim_start_matches('/'))
                .filter(|p| !p.is_empty())
                .map(str::to_owned);
            endpoint
        } else if let Some((protocol, path)) = s.split_once(':') {
            Self::local(protocol, path)
        } else {
            return Err(P2pError::InvalidEndpoint(format!("{s}: missing protocol")));
        };
        endpoint.validate()?;
        Ok(endpoint)
    }
}
