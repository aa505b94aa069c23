//! Identity resolution
//!
//! Works out which public hostname is being mirrored and which local IP
//! literal stands in for it. Two discovery strategies are supported:
//! explicit values (flags or environment) and files on disk (the system
//! hostname plus the `"ipv6"` field of a cjdroute.conf).

use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default port for the file strategy.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default system hostname record.
pub const DEFAULT_HOSTNAME_FILE: &str = "/etc/hostname";

/// cjdroute.conf locations, tried in order.
pub const DEFAULT_CJDROUTE_PATHS: &[&str] = &["/var/www/cjdns/cjdroute.conf", "/etc/cjdroute.conf"];

static IPV6_FIELD: Lazy<Regex> = Lazy::new(|| Regex::new(r#""ipv6":\s*"([^"]*)""#).expect("ipv6 field pattern"));

/// The resolved (public host, local address, port) triple.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    public_host: String,
    local_address: IpAddr,
    port: u16,
}

impl Identity {
    /// Build an identity from already-validated parts.
    ///
    /// The local address must be IPv6, since that is the only family the
    /// listener accepts.
    pub fn new(public_host: impl Into<String>, local_address: IpAddr, port: u16) -> Result<Self, ConfigError> {
        let public_host = public_host.into();
        if public_host.is_empty() {
            return Err(ConfigError::MissingField("public host"));
        }
        if let IpAddr::V4(v4) = local_address {
            return Err(ConfigError::NotIpv6(v4));
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }
        Ok(Self {
            public_host,
            local_address,
            port,
        })
    }

    pub fn public_host(&self) -> &str {
        &self.public_host
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `https://<public host>`
    pub fn public_origin(&self) -> String {
        format!("https://{}", self.public_host)
    }

    /// `http://[<local address>]`, with `:<port>` appended when not 80.
    pub fn local_origin(&self) -> String {
        if self.port == DEFAULT_HTTP_PORT {
            format!("http://[{}]", self.local_address)
        } else {
            format!("http://[{}]:{}", self.local_address, self.port)
        }
    }

    /// Socket address the proxy listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.port)
    }
}

/// Where the identity comes from.
#[derive(Debug, Clone)]
pub enum Discovery {
    /// Values supplied directly (flags or environment variables).
    Explicit {
        public_host: Option<String>,
        local_address: Option<String>,
        port: Option<String>,
    },
    /// System hostname plus the `"ipv6"` field of a cjdroute.conf.
    Files {
        hostname_file: PathBuf,
        config_paths: Vec<PathBuf>,
        port: Option<String>,
    },
}

impl Discovery {
    /// Whether this strategy is the one that reconciles nginx afterwards.
    pub fn is_file_based(&self) -> bool {
        matches!(self, Self::Files { .. })
    }
}

/// Parse an IP literal and return its canonical textual form.
///
/// Canonicalizing an already canonical address returns it unchanged.
pub fn canonicalize_address(raw: &str) -> Result<String, ConfigError> {
    parse_address(raw).map(|ip| ip.to_string())
}

fn parse_address(raw: &str) -> Result<IpAddr, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::MissingField("local address"));
    }
    trimmed.parse::<IpAddr>().map_err(|source| ConfigError::InvalidAddress {
        value: trimmed.to_string(),
        source,
    })
}

fn parse_port(raw: Option<&str>, default: Option<u16>) -> Result<u16, ConfigError> {
    match raw.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => match p.parse::<u16>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidPort(p.to_string())),
            Ok(port) => Ok(port),
        },
        None => default.ok_or(ConfigError::MissingField("port")),
    }
}

/// Resolve the identity for the given strategy.
///
/// Any empty or invalid field is an error; nothing is bound or mutated here.
pub fn resolve(discovery: &Discovery) -> Result<Identity, ConfigError> {
    let identity = match discovery {
        Discovery::Explicit {
            public_host,
            local_address,
            port,
        } => {
            let public_host = public_host.as_deref().map(str::trim).unwrap_or_default();
            if public_host.is_empty() {
                return Err(ConfigError::MissingField("public host"));
            }
            let local_address = parse_address(local_address.as_deref().unwrap_or_default())?;
            let port = parse_port(port.as_deref(), None)?;
            Identity::new(public_host, local_address, port)?
        }
        Discovery::Files {
            hostname_file,
            config_paths,
            port,
        } => {
            let public_host = read_hostname(hostname_file)?;
            let (path, contents) = read_first_available(config_paths)?;
            let raw = extract_ipv6(&contents).ok_or_else(|| ConfigError::Ipv6FieldMissing { path: path.clone() })?;
            debug!("Found ipv6 field {:?} in {}", raw, path.display());
            let local_address = parse_address(&raw)?;
            let port = parse_port(port.as_deref(), Some(DEFAULT_HTTP_PORT))?;
            Identity::new(public_host, local_address, port)?
        }
    };

    info!(
        "Resolved identity: {} <-> [{}]:{}",
        identity.public_host, identity.local_address, identity.port
    );
    Ok(identity)
}

fn read_hostname(path: &Path) -> Result<String, ConfigError> {
    let data = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let host = data.trim().to_string();
    if host.is_empty() {
        return Err(ConfigError::MissingField("public host"));
    }
    Ok(host)
}

/// Read the first candidate that exists, in order.
fn read_first_available(paths: &[PathBuf]) -> Result<(PathBuf, String), ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => return Ok((path.clone(), contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, trying next candidate", path.display());
            }
            Err(source) => {
                return Err(ConfigError::ReadFile {
                    path: path.clone(),
                    source,
                })
            }
        }
    }

    let tried: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    Err(ConfigError::NoConfigFile(tried.join(", ")))
}

/// First `"ipv6": "<value>"` occurrence in `contents`.
pub fn extract_ipv6(contents: &str) -> Option<String> {
    IPV6_FIELD
        .captures(contents)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
