//! Error types for startup and per-exchange failures.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures while resolving the identity pair. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required identity field ended up empty.
    #[error("missing required value: {0}")]
    MissingField(&'static str),

    /// The local address is not an IP literal.
    #[error("invalid IP address: {value}")]
    InvalidAddress {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// The local address is an IPv4 literal; the listener is IPv6-only.
    #[error("local address {0} is not IPv6")]
    NotIpv6(std::net::Ipv4Addr),

    /// The port is not a valid TCP port number.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// A required file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// None of the candidate cjdroute.conf paths were readable.
    #[error("no readable cjdroute.conf among: {0}")]
    NoConfigFile(String),

    /// The config file has no `"ipv6": "..."` field.
    #[error("IPv6 address not found in {}", path.display())]
    Ipv6FieldMissing { path: PathBuf },

    /// A rewrite pattern could not be compiled.
    #[error("invalid rewrite pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Failures while reconciling the external web server.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The service manager command could not be run.
    #[error("`{command}` failed: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },

    /// `restart` ran but reported failure.
    #[error("`{command}` exited with {status}")]
    CommandStatus { command: String, status: String },

    /// The configured wait bound elapsed before the service came up.
    #[error("service {service} not active after {waited:?}")]
    Timeout { service: String, waited: Duration },
}

/// Failures talking to the backend for one exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with backend failed: {0}")]
    Tls(#[source] io::Error),

    #[error("HTTP handshake with backend failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to send request to backend: {0}")]
    Send(#[source] hyper::Error),
}
