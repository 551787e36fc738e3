//! mq node binary.
//!
//! Runs either side of an mq RPC session: `--listen` serves an `echo`
//! service behind an application listener, `--connect` drives calls
//! against one. Both sides can run over mutual TLS.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgGroup, Parser};
use mq_rpc::{RemoteError, RpcSession, Service};
use mq_session::{
    AppTransport, Connector, Listener, Security, Session, SessionRef, TcpTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::NodeConfig;
use logging::MqLogFormatter;

#[cfg(feature = "tls")]
use mq_session::{make_client_config, make_server_config, TlsSettings};

const ECHO_SERVICE: &str = "echo";
const METHOD_ECHO: u32 = 1;
const METHOD_REVERSE: u32 = 2;

/// mq node with optional mTLS
#[derive(Parser, Debug)]
#[command(name = "mq-node", version, about = "mq RPC node with optional mTLS")]
#[command(group(ArgGroup::new("mode").required(true).args(["listen", "connect"])))]
struct Args {
    /// Serve the echo service on this address (e.g. 0.0.0.0:7700)
    #[arg(long)]
    listen: Option<String>,

    /// Connect to a node at this address and issue calls
    #[arg(long)]
    connect: Option<String>,

    /// Number of calls issued in connect mode
    #[arg(long)]
    calls: Option<usize>,

    /// Payload sent with each call
    #[arg(long)]
    payload: Option<String>,

    /// Largest payload a single send may carry
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Send and call timeout (e.g. "30s")
    #[arg(long)]
    send_timeout: Option<humantime::Duration>,

    /// Connection establishment timeout (e.g. "10s")
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable TLS (requires the tls feature)
    #[arg(long)]
    tls: bool,

    /// Certificate chain file (PEM)
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Private key file (PEM)
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// CA certificate file (PEM); on a listener it enables client authentication
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Server name for TLS verification, defaults to the connect host
    #[arg(long, requires = "tls")]
    tls_sni: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "mq.yaml")]
    config: PathBuf,
}

impl Args {
    /// Command-line values win over file and environment
    fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(address) = self.listen.as_ref().or(self.connect.as_ref()) {
            config.app.address = address.clone();
        }
        if let Some(calls) = self.calls {
            config.calls.count = calls;
        }
        if let Some(payload) = &self.payload {
            config.calls.payload = payload.clone();
        }
        if let Some(size) = self.buffer_size {
            config.app.buffer_size = size;
        }
        if let Some(timeout) = self.send_timeout {
            config.app.send_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(timeout) = self.connect_timeout {
            config.app.connection_timeout_ms = timeout.as_millis() as u64;
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(path) = &self.tls_cert {
            config.tls.cert_file = Some(path.clone());
        }
        if let Some(path) = &self.tls_key {
            config.tls.key_file = Some(path.clone());
        }
        if let Some(path) = &self.tls_ca {
            config.tls.ca_file = Some(path.clone());
        }
        if let Some(sni) = &self.tls_sni {
            config.tls.sni = Some(sni.clone());
        }
    }
}

/// Echoes its argument (method 1) or returns it reversed (method 2)
struct EchoService;

#[async_trait]
impl Service for EchoService {
    async fn call(&self, method_id: u32, args: Bytes) -> Result<Bytes, RemoteError> {
        match method_id {
            METHOD_ECHO => Ok(args),
            METHOD_REVERSE => {
                let mut reversed = args.to_vec();
                reversed.reverse();
                Ok(Bytes::from(reversed))
            }
            other => Err(RemoteError::unknown_method(other)),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in ["mq_node", "mq_session", "mq_rpc", "mq_wire"] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(MqLogFormatter::new("mq-node"))
        .init();

    info!("Starting mq node v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let security = match build_security(&config, args.listen.is_some()).await {
        Ok(security) => security,
        Err(e) => {
            error!("TLS setup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.listen.is_some() {
        run_listener(config, security).await
    } else {
        run_calls(config, security).await
    }
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.app.validate()?;

    info!(
        "Session config: address={}, buffer_size={}, send_timeout={}ms, connect_timeout={}ms, max_connections={}",
        config.app.address,
        config.app.buffer_size,
        config.app.send_timeout_ms,
        config.app.connection_timeout_ms,
        config.app.max_connections
    );
    Ok(config)
}

#[cfg(feature = "tls")]
async fn read_pem(path: Option<&std::path::Path>, what: &str) -> Result<Option<String>> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map(Some)
            .with_context(|| format!("Failed to read {} file {:?}", what, path)),
        None => Ok(None),
    }
}

#[cfg(feature = "tls")]
async fn build_security(config: &NodeConfig, server: bool) -> Result<Security> {
    if !config.tls.enabled {
        return Ok(Security::Transparent);
    }

    let tls = &config.tls;
    info!(
        "Loading TLS configuration from cert={:?}, key={:?}, ca={:?}",
        tls.cert_file, tls.key_file, tls.ca_file
    );
    let cert = read_pem(tls.cert_file.as_deref(), "certificate").await?;
    let key = read_pem(tls.key_file.as_deref(), "private key").await?;
    let ca = read_pem(tls.ca_file.as_deref(), "CA").await?;

    let settings = if server {
        let (Some(cert), Some(key)) = (cert, key) else {
            anyhow::bail!("TLS listener needs --tls-cert and --tls-key");
        };
        TlsSettings::server(make_server_config(&cert, &key, ca.as_deref())?)
    } else {
        let Some(ca) = ca else {
            anyhow::bail!("TLS connector needs --tls-ca");
        };
        let identity = match (&cert, &key) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            (None, None) => None,
            _ => anyhow::bail!("Client identity needs both --tls-cert and --tls-key"),
        };
        let server_name = tls
            .sni
            .clone()
            .unwrap_or_else(|| host_of(&config.app.address).to_string());
        TlsSettings::client(make_client_config(&ca, identity)?, &server_name)?
    };

    info!("TLS configuration loaded successfully");
    Ok(Security::Tls(settings))
}

#[cfg(not(feature = "tls"))]
async fn build_security(config: &NodeConfig, _server: bool) -> Result<Security> {
    if config.tls.enabled {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }
    Ok(Security::Transparent)
}

/// Host part of `host:port`, without IPv6 brackets
#[cfg(feature = "tls")]
fn host_of(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

async fn run_listener(config: NodeConfig, security: Security) -> Result<()> {
    let tcp = TcpTransport::new(config.app.clone())?;
    let transport = AppTransport::new(Arc::new(tcp), config.app.clone(), security);

    let app_config = config.app.clone();
    let listener = transport.listener(Arc::new(move |session: SessionRef| {
        let rpc = RpcSession::attach(session, &app_config);
        rpc.serve(ECHO_SERVICE, Arc::new(EchoService));
    }));

    listener.events().connected.subscribe(|session: &SessionRef| {
        component_info!(
            "listener",
            session = session.id(),
            "Session connected from {:?}",
            session.peer_addr()
        );
    });
    listener.events().disconnected.subscribe(|session: &SessionRef| {
        component_info!("listener", session = session.id(), "Session disconnected");
    });

    listener
        .start()
        .await
        .with_context(|| format!("Failed to listen on {}", config.app.address))?;
    info!("Serving '{}' on {:?}", ECHO_SERVICE, listener.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT, shutting down");

    listener.stop().await;
    for session in listener.sessions() {
        session.disconnect();
    }

    info!("mq node shutdown complete");
    Ok(())
}

async fn run_calls(config: NodeConfig, security: Security) -> Result<()> {
    let tcp = TcpTransport::new(config.app.clone())?;
    let connector = AppTransport::new(Arc::new(tcp), config.app.clone(), security).connector(
        Arc::new(|session: SessionRef| {
            component_debug!("connector", session = session.id(), "Transport session created");
        }),
    );
    connector.events().connection_error.subscribe(|reason: &String| {
        component_warn!("connector", "Connection failed: {}", reason);
    });

    let session = connector
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.app.address))?;
    component_info!(
        "connector",
        session = session.id(),
        "Connected to {}",
        config.app.address
    );

    let rpc = RpcSession::attach(session.clone(), &config.app);
    let echo = rpc.register_proxy(ECHO_SERVICE)?;

    let mut failures = 0usize;
    for call in 0..config.calls.count {
        let method = if call % 2 == 0 { METHOD_ECHO } else { METHOD_REVERSE };
        let payload = Bytes::from(format!("{} #{}", config.calls.payload, call));
        let started = Instant::now();

        match echo.call(method, payload).await {
            Ok(reply) => component_info!(
                "rpc",
                call,
                method,
                "Reply in {}: {}",
                humantime::format_duration(started.elapsed()),
                String::from_utf8_lossy(&reply)
            ),
            Err(e) => {
                failures += 1;
                component_error!("rpc", call, method, "Call failed: {}", e);
                if !session.is_connected() {
                    break;
                }
            }
        }
    }

    session.disconnect();

    if failures > 0 {
        anyhow::bail!("{} of {} calls failed", failures, config.calls.count);
    }
    info!("Completed {} calls", config.calls.count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_service_methods() {
        let service = EchoService;
        let echoed = service
            .call(METHOD_ECHO, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(&echoed[..], b"abc");

        let reversed = service
            .call(METHOD_REVERSE, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(&reversed[..], b"cba");

        let err = service.call(7, Bytes::new()).await.unwrap_err();
        assert_eq!(err.code, RemoteError::UNKNOWN_METHOD);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_host_of() {
        assert_eq!(host_of("localhost:7700"), "localhost");
        assert_eq!(host_of("[::1]:7700"), "::1");
        assert_eq!(host_of("node-a"), "node-a");
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let args = Args::parse_from([
            "mq-node",
            "--connect",
            "10.1.1.1:7701",
            "--calls",
            "2",
            "--send-timeout",
            "2s",
        ]);
        let mut config = NodeConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.app.address, "10.1.1.1:7701");
        assert_eq!(config.calls.count, 2);
        assert_eq!(config.app.send_timeout_ms, 2000);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_mode_is_required() {
        assert!(Args::try_parse_from(["mq-node"]).is_err());
        assert!(Args::try_parse_from(["mq-node", "--listen", "a:1", "--connect", "b:2"]).is_err());
    }

    #[test]
    fn test_tls_paths_require_tls_flag() {
        assert!(Args::try_parse_from(["mq-node", "--listen", "a:1", "--tls-cert", "c.pem"]).is_err());
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn test_tls_rejected_without_feature() {
        let mut config = NodeConfig::default();
        config.tls.enabled = true;
        assert!(build_security(&config, true).await.is_err());
    }
}
