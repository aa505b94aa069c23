//! cjdproxy - A rewriting reverse proxy for cjdns nodes
//!
//! Serves an HTTPS site that is only reachable by its public hostname on the
//! node's local IPv6 address over plain HTTP:
//! - Identity discovery from flags/environment or /etc/hostname + cjdroute.conf
//! - One-shot nginx reconciliation to free `[::]:80`
//! - Header, cookie and body rewriting between the two origins
//! - TLS 1.3 forwarding to the loopback backend with SNI pinned to the public host

pub mod error;
pub mod identity;
pub mod proxy;
pub mod reconcile;
pub mod rewrite;
pub mod transport;

pub use error::{ConfigError, ReconcileError, TransportError};
pub use identity::{Discovery, Identity};
pub use proxy::{ProxyConfig, ProxyServer};
pub use reconcile::{ReconcileConfig, Reconciler, ServiceManager, Systemctl};
pub use rewrite::{RefererPolicy, RewriteOptions, Rewriter};
pub use transport::{CertVerification, Transport, TransportConfig};
