use std::fmt::{Display, Formatter};
use std::str::{FromStr, Split};

use hyper::http::uri::{Authority, Uri};

use crate::error::{ResolveError, TargetError};

/// Upstream schemes the forwarding and tunnel handlers know how to talk to.
pub const SUPPORTED_SCHEMES: [&str; 3] = ["http", "https", "proxy"];

/// A candidate produced by a PAC fallback list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Direct,
    Proxy { scheme: String, host: String },
}

impl Upstream {
    /// Parses a single, already trimmed fallback entry such as `DIRECT` or `PROXY host:port`.
    pub fn parse(target: &str) -> Result<Self, TargetError> {
        let fields: Vec<&str> = target.split_whitespace().collect();

        match fields.as_slice() {
            ["DIRECT"] => Ok(Upstream::Direct),
            [_] => Err(TargetError::ExpectedDirect(target.to_string())),
            [kind, host] => Ok(Upstream::Proxy {
                scheme: kind.to_lowercase(),
                host: host.to_string(),
            }),
            _ => Err(TargetError::ExpectedTypeHost(target.to_string())),
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            Upstream::Direct => true,
            Upstream::Proxy { scheme, .. } => SUPPORTED_SCHEMES.contains(&scheme.as_str()),
        }
    }
}

impl Display for Upstream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Direct => write!(f, "DIRECT"),
            Upstream::Proxy { scheme, host } => write!(f, "{}://{}", scheme, host),
        }
    }
}

/// Lazily parsed view over the raw string returned by `FindProxyForURL`.
///
/// A missing or blank return value yields exactly one [`Upstream::Direct`]. Otherwise
/// entries are split on `;`, trimmed, and empty entries are skipped.
pub struct FallbackList<'a> {
    direct: bool,
    entries: Option<Split<'a, char>>,
}

impl<'a> FallbackList<'a> {
    pub fn new(raw: Option<&'a str>) -> Self {
        match raw {
            Some(raw) if !raw.trim().is_empty() => Self {
                direct: false,
                entries: Some(raw.split(';')),
            },
            _ => Self {
                direct: true,
                entries: None,
            },
        }
    }
}

impl Iterator for FallbackList<'_> {
    type Item = Result<Upstream, TargetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.direct {
            self.direct = false;
            return Some(Ok(Upstream::Direct));
        }

        let entries = self.entries.as_mut()?;
        entries
            .map(str::trim)
            .find(|entry| !entry.is_empty())
            .map(Upstream::parse)
    }
}

/// Scheme and authority of a request, stripped of path, query and credentials.
///
/// Its display form doubles as the cache fingerprint and as the `url` handed to the PAC script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestTarget {
    scheme: String,
    authority: String,
    host: String,
    port: Option<u16>,
}

impl RequestTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self, ResolveError> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ResolveError::InvalidTarget(format!("missing scheme in {}", uri)))?;
        let authority = uri
            .authority()
            .ok_or_else(|| ResolveError::InvalidTarget(format!("missing host in {}", uri)))?;

        Ok(Self::new(scheme, authority))
    }

    /// Target of a CONNECT request, given in authority form (`host:port`).
    pub fn connect(authority: &str) -> Result<Self, ResolveError> {
        let authority = Authority::from_str(authority)
            .map_err(|e| ResolveError::InvalidTarget(format!("{}: {}", authority, e)))?;

        Ok(Self::new("https", &authority))
    }

    fn new(scheme: &str, authority: &Authority) -> Self {
        let host = authority.host();
        let port = authority.port_u16();
        let authority = match port {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Self {
            scheme: scheme.to_lowercase(),
            authority,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Hostname without port or IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host:port` to dial when connecting to the target itself.
    pub fn dial_address(&self) -> String {
        match self.port {
            Some(_) => self.authority.clone(),
            None => format!("{}:{}", self.authority, self.default_port()),
        }
    }

    fn default_port(&self) -> u16 {
        match self.scheme.as_str() {
            "https" | "wss" => 443,
            _ => 80,
        }
    }
}

impl Display for RequestTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}
