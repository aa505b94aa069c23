//! cjdproxy - Main entry point
//!
//! Resolves the identity pair, optionally reconciles nginx, then serves.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cjdproxy::identity::{self, Discovery};
use cjdproxy::transport::DEFAULT_UPSTREAM;
use cjdproxy::{
    CertVerification, ProxyConfig, ProxyServer, ReconcileConfig, Reconciler, RefererPolicy,
    RewriteOptions, Rewriter, Systemctl, Transport, TransportConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RefererMode {
    /// Rewrite local-origin referers back to the public origin
    Guarded,
    /// Always send the public origin and echo the original in X-Original-Referer
    Overwrite,
}

impl From<RefererMode> for RefererPolicy {
    fn from(mode: RefererMode) -> Self {
        match mode {
            RefererMode::Guarded => RefererPolicy::Guarded,
            RefererMode::Overwrite => RefererPolicy::Overwrite,
        }
    }
}

/// cjdproxy - Serve an HTTPS-only site on a local IPv6 address
#[derive(Parser, Debug)]
#[command(name = "cjdproxy")]
#[command(author = "cjdproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Rewriting reverse proxy from a local IPv6 address to a public HTTPS host")]
struct Args {
    /// Public hostname (selects explicit discovery)
    #[arg(long, env = "PUBLIC_HOST")]
    public_host: Option<String>,

    /// Local IP address to listen on (selects explicit discovery)
    #[arg(long, env = "LOCAL_ADDRESS")]
    local_address: Option<String>,

    /// Port to listen on (defaults to 80 with file discovery)
    #[arg(long, env = "PROXY_PORT")]
    port: Option<String>,

    /// Hostname record used by file discovery
    #[arg(long, env = "HOSTNAME_FILE", default_value = identity::DEFAULT_HOSTNAME_FILE)]
    hostname_file: PathBuf,

    /// cjdroute.conf candidates, tried in order
    #[arg(
        long,
        env = "CJDROUTE_CONF",
        value_delimiter = ',',
        default_values_t = identity::DEFAULT_CJDROUTE_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>()
    )]
    cjdroute_conf: Vec<String>,

    /// Backend address dialed over TLS
    #[arg(long, env = "UPSTREAM_ADDR", default_value = DEFAULT_UPSTREAM)]
    upstream: SocketAddr,

    /// Validate the backend certificate against web PKI roots
    #[arg(long, env = "VERIFY_BACKEND_CERT", default_value = "false")]
    verify_backend_cert: bool,

    /// Referer handling policy
    #[arg(long, env = "REFERER_POLICY", value_enum, default_value = "guarded")]
    referer_policy: RefererMode,

    /// Extra origins rewritten in Location headers
    #[arg(long, env = "LOCATION_ALIASES", value_delimiter = ',')]
    location_alias: Vec<String>,

    /// TCP keep-alive period in seconds
    #[arg(long, env = "KEEPALIVE_SECS", default_value = "180", value_parser = clap::value_parser!(u64).range(1..))]
    keepalive_secs: u64,

    /// Do not touch nginx even with file discovery
    #[arg(long, env = "NO_RECONCILE", default_value = "false")]
    no_reconcile: bool,

    /// nginx configuration directory
    #[arg(long, env = "NGINX_CONF_DIR", default_value = "/etc/nginx/conf.d")]
    nginx_conf_dir: PathBuf,

    /// nginx service name
    #[arg(long, env = "NGINX_SERVICE", default_value = "nginx")]
    nginx_service: String,

    /// Interval between nginx status checks in milliseconds
    #[arg(long, env = "RECONCILE_POLL_MS", default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    reconcile_poll_ms: u64,

    /// Give up waiting for nginx after this many seconds (default: wait forever)
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS")]
    reconcile_timeout_secs: Option<u64>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn discovery(&self) -> Discovery {
        if self.public_host.is_some() || self.local_address.is_some() {
            Discovery::Explicit {
                public_host: self.public_host.clone(),
                local_address: self.local_address.clone(),
                port: self.port.clone(),
            }
        } else {
            Discovery::Files {
                hostname_file: self.hostname_file.clone(),
                config_paths: self.cjdroute_conf.iter().map(PathBuf::from).collect(),
                port: self.port.clone(),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting cjdproxy v1.0.0");

    let discovery = args.discovery();
    let identity = identity::resolve(&discovery)
        .inspect_err(|e| error!("Identity resolution failed: {}", e))
        .context("One or more settings are missing or invalid; set PUBLIC_HOST/LOCAL_ADDRESS/PROXY_PORT or provide the hostname file and cjdroute.conf")?;

    if discovery.is_file_based() && !args.no_reconcile {
        let config = ReconcileConfig {
            conf_dir: args.nginx_conf_dir.clone(),
            service: args.nginx_service.clone(),
            poll_interval: Duration::from_millis(args.reconcile_poll_ms),
            timeout: args.reconcile_timeout_secs.map(Duration::from_secs),
            ..ReconcileConfig::for_port(identity.port())
        };
        Reconciler::new(config, Systemctl)
            .run()
            .await
            .inspect_err(|e| error!("nginx reconciliation failed: {}", e))?;
    }

    let verification = if args.verify_backend_cert {
        CertVerification::WebPki
    } else {
        CertVerification::Skip
    };
    let transport = Transport::new(&TransportConfig {
        upstream: args.upstream,
        server_name: identity.public_host().to_string(),
        verification,
    })?;

    let rewriter = Rewriter::new(
        &identity,
        RewriteOptions {
            referer_policy: args.referer_policy.into(),
            location_aliases: args.location_alias.clone(),
        },
    )?;

    let config = ProxyConfig {
        keepalive: Duration::from_secs(args.keepalive_secs),
        ..ProxyConfig::for_identity(&identity)
    };

    let server = Arc::new(ProxyServer::new(config, Arc::new(rewriter), Arc::new(transport)));

    info!("cjdproxy started successfully");

    server
        .run()
        .await
        .inspect_err(|e| error!("Error running server: {:#}", e))
}
