// # subnetd - Overlay Subnet Daemon
//
// This is a THIN integration layer. All lease logic lives in subnet-core;
// the daemon only wires components together.
//
// The subnetd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Connecting the etcd registry and acquiring this node's lease
// 4. Writing the subnet file, following peer leases and renewing its own
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### etcd
// - `SUBNETD_ETCD_ENDPOINTS`: Comma-separated endpoints (default http://127.0.0.1:2379)
// - `SUBNETD_ETCD_PREFIX`: Key prefix (default /coreos.com/network)
// - `SUBNETD_ETCD_USERNAME` / `SUBNETD_ETCD_PASSWORD`: Credentials (optional)
// - `SUBNETD_ETCD_CAFILE` / `SUBNETD_ETCD_CERTFILE` / `SUBNETD_ETCD_KEYFILE`: TLS (optional)
//
// ### Node
// - `SUBNETD_PUBLIC_IP`: IPv4 address peers reach this node on (required)
// - `SUBNETD_PUBLIC_IPV6`: IPv6 address peers reach this node on (optional)
// - `SUBNETD_BACKEND_TYPE`: Backend advertised in the lease (default vxlan)
//
// ### Subnet file
// - `SUBNETD_SUBNET_FILE`: Path (default /run/flannel/subnet.env)
// - `SUBNETD_IP_MASQ`: Whether masquerading is set up (default false)
// - `SUBNETD_MTU`: MTU advertised to backends (default 1450)
//
// ### Lease
// - `SUBNETD_RENEW_MARGIN_MINS`: Renew this long before expiry (default 60)
//
// ## Example
//
// ```bash
// export SUBNETD_ETCD_ENDPOINTS=https://10.0.0.2:2379
// export SUBNETD_ETCD_CAFILE=/etc/subnetd/ca.pem
// export SUBNETD_PUBLIC_IP=10.0.0.5
//
// subnetd
// ```

use anyhow::{Context, Result};
use std::env;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use subnet_core::watch::{WATCH_CHANNEL_CAPACITY, watch_leases};
use subnet_core::{
    Event, EventType, Lease, LeaseAttrs, LocalManager, Manager, read_subnet_file,
};
use subnet_registry_etcd::{DEFAULT_ENDPOINT, DEFAULT_PREFIX, EtcdConfig, EtcdRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

const DEFAULT_SUBNET_FILE: &str = "/run/flannel/subnet.env";
const DEFAULT_BACKEND_TYPE: &str = "vxlan";
const DEFAULT_MTU: u32 = 1450;
const DEFAULT_RENEW_MARGIN_MINS: u64 = 60;

/// How long background tasks get to wind down after cancellation
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before restarting a failed peer lease watch
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: The node's lease was revoked
/// - 3: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubnetdExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Lease removed out of band
    LeaseRevoked = 2,
    /// Runtime error (unexpected failure)
    RuntimeError = 3,
}

impl From<SubnetdExitCode> for ExitCode {
    fn from(code: SubnetdExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
struct Config {
    etcd_endpoints: Vec<String>,
    etcd_prefix: String,
    etcd_username: Option<String>,
    etcd_password: Option<String>,
    etcd_ca_file: Option<PathBuf>,
    etcd_cert_file: Option<PathBuf>,
    etcd_key_file: Option<PathBuf>,
    public_ip: String,
    public_ipv6: Option<String>,
    backend_type: String,
    subnet_file: PathBuf,
    ip_masq: bool,
    mtu: u32,
    renew_margin_mins: u64,
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            etcd_prefix: DEFAULT_PREFIX.to_string(),
            etcd_username: None,
            etcd_password: None,
            etcd_ca_file: None,
            etcd_cert_file: None,
            etcd_key_file: None,
            public_ip: String::new(),
            public_ipv6: None,
            backend_type: DEFAULT_BACKEND_TYPE.to_string(),
            subnet_file: PathBuf::from(DEFAULT_SUBNET_FILE),
            ip_masq: false,
            mtu: DEFAULT_MTU,
            renew_margin_mins: DEFAULT_RENEW_MARGIN_MINS,
            log_level: "info".to_string(),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_nonempty(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} '{}' is not valid: {}", name, raw, e)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            etcd_endpoints: env_nonempty("SUBNETD_ETCD_ENDPOINTS")
                .map(|s| {
                    s.split(',')
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.etcd_endpoints),
            etcd_prefix: env_nonempty("SUBNETD_ETCD_PREFIX").unwrap_or(defaults.etcd_prefix),
            etcd_username: env_nonempty("SUBNETD_ETCD_USERNAME"),
            etcd_password: env_nonempty("SUBNETD_ETCD_PASSWORD"),
            etcd_ca_file: env_nonempty("SUBNETD_ETCD_CAFILE").map(PathBuf::from),
            etcd_cert_file: env_nonempty("SUBNETD_ETCD_CERTFILE").map(PathBuf::from),
            etcd_key_file: env_nonempty("SUBNETD_ETCD_KEYFILE").map(PathBuf::from),
            public_ip: env::var("SUBNETD_PUBLIC_IP").unwrap_or_default(),
            public_ipv6: env_nonempty("SUBNETD_PUBLIC_IPV6"),
            backend_type: env_nonempty("SUBNETD_BACKEND_TYPE").unwrap_or(defaults.backend_type),
            subnet_file: env_nonempty("SUBNETD_SUBNET_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.subnet_file),
            ip_masq: env_parsed("SUBNETD_IP_MASQ", defaults.ip_masq)?,
            mtu: env_parsed("SUBNETD_MTU", defaults.mtu)?,
            renew_margin_mins: env_parsed("SUBNETD_RENEW_MARGIN_MINS", defaults.renew_margin_mins)?,
            log_level: env_nonempty("SUBNETD_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Validate the configuration
    ///
    /// This performs comprehensive validation including:
    /// - Required field presence
    /// - Address and endpoint formats
    /// - Numeric range validation
    /// - TLS and credential pairing
    fn validate(&self) -> Result<()> {
        if self.public_ip.trim().is_empty() {
            anyhow::bail!(
                "SUBNETD_PUBLIC_IP is required. \
                Set it via: export SUBNETD_PUBLIC_IP=10.0.0.5"
            );
        }
        let public_ip = self.public_ip()?;
        if public_ip.is_unspecified() || public_ip.is_multicast() {
            anyhow::bail!("SUBNETD_PUBLIC_IP must be a unicast address. Got: {}", public_ip);
        }
        self.public_ipv6()?;

        if self.etcd_endpoints.is_empty() {
            anyhow::bail!("SUBNETD_ETCD_ENDPOINTS must contain at least one endpoint");
        }
        for endpoint in &self.etcd_endpoints {
            if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                anyhow::bail!(
                    "SUBNETD_ETCD_ENDPOINTS entries must use HTTP or HTTPS scheme. Got: {}",
                    endpoint
                );
            }
        }

        if !self.etcd_prefix.starts_with('/') {
            anyhow::bail!(
                "SUBNETD_ETCD_PREFIX must be an absolute key path. Got: {}",
                self.etcd_prefix
            );
        }

        if self.etcd_password.is_some() && self.etcd_username.is_none() {
            anyhow::bail!("SUBNETD_ETCD_PASSWORD is set but SUBNETD_ETCD_USERNAME is not");
        }

        if self.etcd_cert_file.is_some() != self.etcd_key_file.is_some() {
            anyhow::bail!(
                "SUBNETD_ETCD_CERTFILE and SUBNETD_ETCD_KEYFILE must be set together"
            );
        }

        if self.backend_type.is_empty() {
            anyhow::bail!("SUBNETD_BACKEND_TYPE cannot be empty");
        }

        if self.subnet_file.file_name().is_none() {
            anyhow::bail!(
                "SUBNETD_SUBNET_FILE must name a file. Got: {}",
                self.subnet_file.display()
            );
        }

        if !(68..=65535).contains(&self.mtu) {
            anyhow::bail!("SUBNETD_MTU must be between 68 and 65535. Got: {}", self.mtu);
        }

        if !(1..=1439).contains(&self.renew_margin_mins) {
            anyhow::bail!(
                "SUBNETD_RENEW_MARGIN_MINS must be between 1 and 1439 minutes. Got: {}",
                self.renew_margin_mins
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "SUBNETD_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    fn public_ip(&self) -> Result<Ipv4Addr> {
        self.public_ip
            .trim()
            .parse()
            .with_context(|| format!("SUBNETD_PUBLIC_IP '{}' is not an IPv4 address", self.public_ip))
    }

    fn public_ipv6(&self) -> Result<Option<Ipv6Addr>> {
        self.public_ipv6
            .as_deref()
            .map(|ip| {
                ip.trim()
                    .parse()
                    .with_context(|| format!("SUBNETD_PUBLIC_IPV6 '{}' is not an IPv6 address", ip))
            })
            .transpose()
    }

    fn renew_margin(&self) -> Duration {
        Duration::from_secs(self.renew_margin_mins * 60)
    }

    fn etcd(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.etcd_endpoints.clone(),
            prefix: self.etcd_prefix.clone(),
            username: self.etcd_username.clone(),
            password: self.etcd_password.clone(),
            ca_file: self.etcd_ca_file.clone(),
            cert_file: self.etcd_cert_file.clone(),
            key_file: self.etcd_key_file.clone(),
        }
    }

    fn lease_attrs(&self) -> Result<LeaseAttrs> {
        let mut attrs = LeaseAttrs::new(self.public_ip()?).with_backend_type(&self.backend_type);
        if let Some(ip6) = self.public_ipv6()? {
            attrs = attrs.with_public_ipv6(ip6);
        }
        Ok(attrs)
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return SubnetdExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return SubnetdExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return SubnetdExitCode::ConfigError.into();
    }

    info!("Starting subnetd daemon");

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return SubnetdExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(config)).into()
}

/// Run the daemon
async fn run_daemon(config: Config) -> SubnetdExitCode {
    let (manager, lease) = match start(&config).await {
        Ok(started) => started,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return SubnetdExitCode::ConfigError;
        }
    };

    match serve(manager, lease).await {
        Ok(()) => {
            info!("Shutting down daemon");
            SubnetdExitCode::CleanShutdown
        }
        Err(e) if is_lease_revoked(&e) => {
            error!("Lease was revoked: {:#}", e);
            SubnetdExitCode::LeaseRevoked
        }
        Err(e) => {
            error!("Daemon error: {:#}", e);
            SubnetdExitCode::RuntimeError
        }
    }
}

fn is_lease_revoked(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<subnet_core::Error>(),
        Some(subnet_core::Error::LeaseRevoked)
    )
}

/// Connect, acquire the lease and publish the subnet file
async fn start(config: &Config) -> Result<(Arc<LocalManager>, Lease)> {
    let registry = EtcdRegistry::connect(&config.etcd())
        .await
        .context("failed to connect to etcd")?;

    let previous = read_subnet_file(&config.subnet_file).await?;
    if let Some(sn) = previous.subnet {
        info!("Found previous subnet {} in {}", sn, config.subnet_file.display());
    }

    let manager = Arc::new(LocalManager::new(
        Box::new(registry),
        previous.subnet,
        previous.ipv6_subnet,
        config.renew_margin(),
    ));
    info!("Using {}", manager.name());

    let network = manager
        .get_network_config()
        .await
        .context("failed to load the network config")?;
    info!(backend = %network.backend_type, "Network config loaded");

    let lease = manager
        .acquire_lease(&config.lease_attrs()?)
        .await
        .context("failed to acquire a lease")?;
    info!(
        subnet = ?lease.subnet,
        ipv6_subnet = ?lease.ipv6_subnet,
        expiration = ?lease.expiration,
        "Lease acquired"
    );

    manager
        .handle_subnet_file(
            &config.subnet_file,
            &network,
            config.ip_masq,
            lease.subnet,
            lease.ipv6_subnet,
            config.mtu,
        )
        .await
        .context("failed to write the subnet file")?;

    Ok((manager, lease))
}

/// Follow peer leases and keep our own alive until shutdown or revocation
async fn serve(manager: Arc<LocalManager>, lease: Lease) -> Result<()> {
    let cancel = CancellationToken::new();

    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let mut watcher: JoinHandle<subnet_core::Result<()>> = tokio::spawn(follow_peers(
        Arc::clone(&manager),
        lease.clone(),
        tx,
        cancel.clone(),
    ));
    let logger = tokio::spawn(log_peer_events(rx));

    let mut renewal: JoinHandle<subnet_core::Result<()>> = tokio::spawn({
        let manager = Arc::clone(&manager);
        let cancel = cancel.clone();
        async move { manager.complete_lease(lease, &cancel).await }
    });

    info!("Daemon initialized successfully");

    let mut watcher_done = false;
    let result = tokio::select! {
        signal = wait_for_shutdown() => {
            match signal {
                Ok(signal) => info!("Received shutdown signal: {}", signal),
                Err(e) => error!("Shutdown error: {}", e),
            }
            cancel.cancel();
            join_with_timeout(&mut renewal).await
        }
        res = &mut renewal => {
            cancel.cancel();
            res.context("renewal task panicked")
                .and_then(|r| r.map_err(anyhow::Error::from))
        }
        res = &mut watcher => {
            watcher_done = true;
            cancel.cancel();
            let err = match res {
                Ok(Ok(())) => anyhow::anyhow!("lease watch stopped unexpectedly"),
                Ok(Err(e)) => anyhow::Error::from(e).context("lease watch failed"),
                Err(e) => anyhow::anyhow!("lease watch task panicked: {}", e),
            };
            match join_with_timeout(&mut renewal).await {
                Err(e) if is_lease_revoked(&e) => Err(e),
                _ => Err(err),
            }
        }
    };

    if !watcher_done {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, watcher).await {
            Ok(Ok(Err(e))) => warn!("Lease watch ended with an error: {}", e),
            Ok(Err(e)) => warn!("Lease watch task panicked: {}", e),
            Err(_) => warn!("Lease watch did not stop within {:?}", SHUTDOWN_TIMEOUT),
            Ok(Ok(Ok(()))) => {}
        }
    }
    let _ = logger.await;

    result
}

/// Run the all-leases watch, restarting it from scratch after store failures
///
/// Each restart starts a fresh `LeaseWatcher`, so peers are announced
/// again. Returns `Ok(())` on cancellation or when `tx` is closed, and the
/// error when it is not worth retrying.
async fn follow_peers(
    manager: Arc<LocalManager>,
    own: Lease,
    tx: mpsc::Sender<Vec<Event>>,
    cancel: CancellationToken,
) -> subnet_core::Result<()> {
    loop {
        let res = watch_leases(manager.as_ref(), Some(own.clone()), tx.clone(), cancel.clone()).await;
        match res {
            Ok(()) => return Ok(()),
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) if e.is_retryable() || matches!(e, subnet_core::Error::WatchClosed) => {
                warn!(
                    "Lease watch failed, restarting in {:?}: {}",
                    WATCH_RESTART_DELAY, e
                );
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tx.closed() => return Ok(()),
            _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
        }
    }
}

async fn join_with_timeout(task: &mut JoinHandle<subnet_core::Result<()>>) -> Result<()> {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(joined) => joined.context("renewal task panicked")?.map_err(anyhow::Error::from),
        Err(_) => Err(anyhow::anyhow!(
            "Shutdown timeout after {:?}",
            SHUTDOWN_TIMEOUT
        )),
    }
}

/// Report peer lease changes until the watch closes the queue
async fn log_peer_events(mut rx: mpsc::Receiver<Vec<Event>>) {
    while let Some(batch) = rx.recv().await {
        debug!("Received {} lease event(s)", batch.len());
        for event in batch {
            let verb = match event.event_type {
                EventType::Added => "added",
                EventType::Removed => "removed",
            };
            info!(
                subnet = ?event.lease.subnet,
                ipv6_subnet = ?event.lease.ipv6_subnet,
                public_ip = %event.lease.attrs.public_ip,
                backend = %event.lease.attrs.backend_type,
                "Peer lease {}", verb
            );
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received, or an error if the handlers
/// cannot be installed.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
