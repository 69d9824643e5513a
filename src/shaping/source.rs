//! Source identification for inbound requests.

use axum::extract::ConnectInfo;
use http::Request;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::{Result, ShaperError};

/// Connection-level remote address of a request, as `"host:port"`.
///
/// Transports that do not go through axum insert this into the request
/// extensions so the default extractor can find the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddr(pub String);

impl From<SocketAddr> for RemoteAddr {
    fn from(addr: SocketAddr) -> Self {
        RemoteAddr(addr.to_string())
    }
}

/// Derives the identifier that partitions shaping state from a request.
///
/// Implementations must be deterministic: every request from one client must
/// map to the same identifier.
pub trait SourceExtractor: Send + Sync + 'static {
    /// Extract the source identifier of `request`.
    fn extract<B>(&self, request: &Request<B>) -> Result<String>;
}

/// Identifies a request by the host part of its remote address.
///
/// Looks for a [`RemoteAddr`] extension first, then for axum's
/// `ConnectInfo<SocketAddr>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddrExtractor;

impl SourceExtractor for RemoteAddrExtractor {
    fn extract<B>(&self, request: &Request<B>) -> Result<String> {
        let extensions = request.extensions();

        if let Some(RemoteAddr(addr)) = extensions.get::<RemoteAddr>() {
            return split_host_port(addr).map(str::to_owned);
        }

        if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(addr.ip().to_string());
        }

        Err(ShaperError::SourceExtraction(
            "request carries no remote address".to_string(),
        ))
    }
}

/// Split `"host:port"` or `"[host]:port"` and return the host.
pub fn split_host_port(addr: &str) -> Result<&str> {
    let invalid =
        |reason: &str| ShaperError::SourceExtraction(format!("{} in address {:?}", reason, addr));

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing ']'"))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port"))?;
        if port.contains(':') {
            return Err(invalid("too many colons"));
        }
        return Ok(host);
    }

    let (host, _port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if host.contains(':') {
        return Err(invalid("too many colons"));
    }
    if host.contains('[') || host.contains(']') {
        return Err(invalid("unexpected bracket"));
    }
    Ok(host)
}

/// An IP network written as `addr/prefix`, or a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange {
    network: IpAddr,
    prefix: u8,
}

impl SourceRange {
    /// Parse `"10.0.0.0/8"`, `"2001:db8::/32"` or a bare address.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || ShaperError::Config(format!("invalid source range: {:?}", text));
        let text = text.trim();

        let (addr, prefix) = match text.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (text, None),
        };

        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return Err(invalid());
        }

        Ok(Self { network, prefix })
    }

    /// Whether `ip` falls within the range.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(network) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(network) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Sources exempt from shaping.
#[derive(Debug, Clone, Default)]
pub struct SourceRanges {
    ranges: Vec<SourceRange>,
}

impl SourceRanges {
    /// Parse every entry; any invalid entry fails the whole list.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let ranges = entries
            .iter()
            .map(|entry| SourceRange::parse(entry.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ranges })
    }

    /// Whether `source` is an address inside one of the ranges.
    ///
    /// Identifiers that are not IP addresses never match.
    pub fn contains(&self, source: &str) -> bool {
        if self.ranges.is_empty() {
            return false;
        }
        match source.parse::<IpAddr>() {
            Ok(ip) => self.ranges.iter().any(|range| range.contains(ip)),
            Err(_) => false,
        }
    }
}
