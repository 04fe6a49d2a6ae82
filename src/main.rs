//! Peerlink CLI - reach TCP services behind a listener over a peer-to-peer link
//!
//! Run `peerlink listen` next to the services, then `peerlink forward` on the
//! machine that needs them. Connections are relayed through TURN when a direct
//! path cannot be found.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{ConfigManager, PeerlinkConfig};
use peerlink_lib::{
    probe_ice_server, DialOptions, Dialer, IceServer, IceTransportPolicy, Listener,
    ListenerConfig, ProbeOptions, RtcConfig, SignalingConfig,
};

/// Peerlink - Dial TCP services inside a remote network
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(about = "Dial TCP services inside a remote network over a peer-to-peer link")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept dialers and connect their streams to local destinations
    #[command(long_about = r#"
Accept signaling connections and serve every dialer over its own
peer-to-peer transport. Each proxied stream is connected to the
destination the dialer asks for.

EXAMPLES:
  # Plain websocket signaling with an access token
  peerlink listen --bind 0.0.0.0:8443 --token $PEERLINK_TOKEN

  # TLS signaling, relaying through TURN when needed
  peerlink listen --bind 0.0.0.0:8443 --tls-cert cert.pem --tls-key key.pem \
    --ice-server turn:turn.example.com:3478 --ice-username user --ice-credential pass
    "#)]
    Listen {
        /// Address to accept signaling connections on
        #[arg(long, env = "PEERLINK_BIND", default_value = "0.0.0.0:8443")]
        bind: SocketAddr,

        /// WebSocket path
        #[arg(long, default_value = "/")]
        path: String,

        /// Access token required from dialers
        #[arg(long, env = "PEERLINK_TOKEN")]
        token: Option<String>,

        /// TLS certificate (PEM) for wss:// signaling
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<String>,

        /// TLS private key (PEM)
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<String>,

        #[command(flatten)]
        ice: IceArgs,

        /// Destination connect timeout in seconds
        #[arg(long, default_value = "10")]
        connect_timeout: u64,

        /// Seconds a disconnected session is kept before teardown
        #[arg(long, default_value = "5")]
        teardown_timeout: u64,
    },

    /// Expose a remote TCP destination on a local port
    #[command(long_about = r#"
Connect to a listener and forward every connection accepted on a local
address to a destination reachable from the listener. Reconnects with
exponential backoff when the peer transport is lost.

EXAMPLES:
  # Reach PostgreSQL next to the listener on local port 5433
  peerlink forward --url ws://agent.example.com:8443/ \
    --local 127.0.0.1:5433 --remote 127.0.0.1:5432

ENVIRONMENT VARIABLES:
  PEERLINK_URL    Signaling URL
  PEERLINK_TOKEN  Access token
    "#)]
    Forward {
        #[command(flatten)]
        dial: DialArgs,

        /// Local address to accept connections on
        #[arg(long)]
        local: SocketAddr,

        /// Destination as seen from the listener (host:port)
        #[arg(long)]
        remote: String,

        /// Network used to reach the destination (tcp, tcp4, tcp6)
        #[arg(long, default_value = "tcp")]
        network: String,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },

    /// Measure round trips over the control channel
    Ping {
        #[command(flatten)]
        dial: DialArgs,

        /// Number of probes
        #[arg(short, long, default_value = "4")]
        count: u32,

        /// Seconds between probes
        #[arg(long, default_value = "1")]
        interval: u64,
    },

    /// Check that a STUN/TURN server is reachable and accepts the credentials
    ProbeIce {
        /// Server URL (stun:, stuns:, turn:, turns:)
        url: String,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        credential: Option<String>,

        /// Skip certificate verification for stuns:/turns:
        #[arg(long)]
        insecure: bool,

        /// Timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Manage stored defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Set the default signaling URL
    SetUrl { url: String },
    /// Set the default access token
    SetToken { token: String },
    /// Add a STUN/TURN server used on every dial
    AddIceServer {
        url: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        credential: Option<String>,
    },
    /// Show the stored configuration
    Show,
    /// Remove every stored setting
    Clear,
}

#[derive(Args, Debug)]
struct IceArgs {
    /// STUN/TURN server URL (repeatable)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Username for TURN servers
    #[arg(long)]
    ice_username: Option<String>,

    /// Credential for TURN servers
    #[arg(long)]
    ice_credential: Option<String>,

    /// Only use relayed candidates
    #[arg(long)]
    relay_only: bool,
}

impl IceArgs {
    fn servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .iter()
            .map(|url| {
                let server = IceServer::new(url.clone());
                match (&self.ice_username, &self.ice_credential) {
                    (Some(user), Some(pass)) => server.with_credentials(user, pass),
                    _ => server,
                }
            })
            .collect()
    }

    fn rtc_config(&self, stored: &[IceServer]) -> RtcConfig {
        let mut servers = self.servers();
        if servers.is_empty() {
            servers = stored.to_vec();
        }

        let mut rtc = RtcConfig::default().with_ice_servers(servers);
        if self.relay_only {
            rtc = rtc.with_policy(IceTransportPolicy::Relay);
        }
        rtc
    }
}

#[derive(Args, Debug)]
struct DialArgs {
    /// Signaling URL (ws:// or wss://); defaults to the stored URL
    #[arg(long, env = "PEERLINK_URL")]
    url: Option<String>,

    /// Access token; defaults to the stored token
    #[arg(long, env = "PEERLINK_TOKEN")]
    token: Option<String>,

    #[command(flatten)]
    ice: IceArgs,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "30")]
    handshake_timeout: u64,
}

impl DialArgs {
    fn resolve(&self, stored: &PeerlinkConfig) -> Result<(String, DialOptions)> {
        let url = self
            .url
            .clone()
            .or_else(|| stored.signaling_url.clone())
            .context("No signaling URL: pass --url or run `peerlink config set-url`")?;

        let mut signaling = SignalingConfig::client_default();
        if let Some(token) = self.token.as_ref().or(stored.token.as_ref()) {
            signaling = signaling.with_token(token);
        }
        if self.insecure {
            warn!("⚠️  Certificate verification disabled (insecure mode)");
            signaling = signaling.with_insecure_skip_verify();
        }

        let options = DialOptions::default()
            .with_signaling_config(signaling)
            .with_rtc_config(self.ice.rtc_config(&stored.ice_servers))
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout));

        Ok((url, options))
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn listen(config: ListenerConfig) -> Result<()> {
    let listener = Listener::bind(config)
        .await
        .context("Failed to start listener")?;
    info!("Signaling URL: {}", listener.url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    listener.close().await.context("Failed to close listener")?;
    info!("Listener stopped");
    Ok(())
}

/// Forward local connections, reconnecting the dialer with exponential backoff
async fn forward_with_reconnect(
    url: String,
    options: DialOptions,
    local: TcpListener,
    target: Arc<Target>,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        if max_attempts > 0 && attempt > max_attempts {
            error!("Maximum reconnection attempts ({}) reached", max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        match Dialer::connect(&url, options.clone()).await {
            Ok(dialer) => {
                info!(client_id = dialer.client_id(), "Peer transport established");
                attempt = 0;
                current_delay = initial_delay;

                let dialer = Arc::new(dialer);
                serve_local(&local, dialer.clone(), target.clone()).await;
                let _ = dialer.close().await;
                warn!("Peer transport lost");
            }
            Err(e) if e.is_configuration_error() => {
                return Err(e).context("Relay configuration rejected");
            }
            Err(e) => {
                error!("Connection error: {}", e);
            }
        }

        warn!(
            "Reconnecting in {} seconds... (attempt {} of {})",
            current_delay.as_secs(),
            attempt + 1,
            if max_attempts == 0 {
                "∞".to_string()
            } else {
                max_attempts.to_string()
            }
        );
        tokio::time::sleep(current_delay).await;

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, max_delay);
    }
}

#[derive(Debug)]
struct Target {
    network: String,
    address: String,
}

async fn serve_local(local: &TcpListener, dialer: Arc<Dialer>, target: Arc<Target>) {
    loop {
        tokio::select! {
            _ = dialer.wait_closed() => return,
            accepted = local.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted local connection from {}", peer);
                    let dialer = dialer.clone();
                    let target = target.clone();
                    tokio::spawn(async move {
                        if let Err(e) = proxy(socket, &dialer, &target).await {
                            warn!("Connection from {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept local connection: {}", e),
            },
        }
    }
}

async fn proxy(mut socket: TcpStream, dialer: &Dialer, target: &Target) -> Result<()> {
    let mut stream = dialer
        .dial(&target.network, &target.address)
        .await
        .context(format!("Failed to dial {}", target.address))?;

    let (sent, received) = tokio::io::copy_bidirectional(&mut socket, &mut stream)
        .await
        .unwrap_or((stream.bytes_sent(), stream.bytes_received()));
    debug!(
        stream_id = stream.stream_id(),
        bytes_sent = sent,
        bytes_received = received,
        "Local connection closed"
    );
    Ok(())
}

async fn ping(url: String, options: DialOptions, count: u32, interval: Duration) -> Result<()> {
    let dialer = Dialer::connect(&url, options)
        .await
        .context("Failed to connect")?;
    info!(state = %dialer.state(), "Connected to {}", url);

    let mut failures = 0;
    for seq in 1..=count {
        let start = Instant::now();
        match dialer.ping().await {
            Ok(()) => println!("seq={} time={:.1?}", seq, start.elapsed()),
            Err(e) if e.is_closed() => {
                dialer.close().await.ok();
                return Err(e).context("Peer transport closed");
            }
            Err(e) => {
                failures += 1;
                println!("seq={} error: {}", seq, e);
            }
        }
        if seq < count {
            tokio::time::sleep(interval).await;
        }
    }

    dialer.close().await.context("Failed to close dialer")?;
    if failures > 0 {
        anyhow::bail!("{} of {} probes failed", failures, count);
    }
    Ok(())
}

async fn probe_ice(server: IceServer, options: ProbeOptions) -> Result<()> {
    match probe_ice_server(&server, &options).await {
        Ok(reports) => {
            for report in reports {
                match report.mapped_address {
                    Some(addr) => println!("{}: ok in {:.1?} (mapped {})", report.url, report.rtt, addr),
                    None => println!("{}: ok in {:.1?}", report.url, report.rtt),
                }
            }
            Ok(())
        }
        Err(e) if e.is_configuration_error() => {
            Err(e).context("ICE server configuration is wrong")
        }
        Err(e) => Err(e).context("ICE server unusable"),
    }
}

fn handle_config(action: ConfigAction) -> Result<()> {
    let manager = ConfigManager::new()?;

    match action {
        ConfigAction::SetUrl { url } => {
            manager.set_url(url)?;
            println!("✅ Signaling URL saved to {:?}", manager.path());
        }
        ConfigAction::SetToken { token } => {
            manager.set_token(token)?;
            println!("✅ Access token saved to {:?}", manager.path());
        }
        ConfigAction::AddIceServer {
            url,
            username,
            credential,
        } => {
            let mut server = IceServer::new(url);
            if let (Some(user), Some(pass)) = (username, credential) {
                server = server.with_credentials(user, pass);
            }
            server
                .parsed_urls()
                .map_err(|e| anyhow::anyhow!("Invalid ICE server URL: {}", e))?;
            manager.add_ice_server(server)?;
            println!("✅ ICE server saved to {:?}", manager.path());
        }
        ConfigAction::Show => {
            let config = manager.load()?;
            println!(
                "Signaling URL: {}",
                config.signaling_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "Access token:  {}",
                if config.token.is_some() { "(set)" } else { "(not set)" }
            );
            for server in &config.ice_servers {
                let auth = if server.username.is_some() { " (with credentials)" } else { "" };
                println!("ICE server:    {}{}", server.urls.join(", "), auth);
            }
        }
        ConfigAction::Clear => {
            manager.clear()?;
            println!("✅ Configuration cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Listen {
            bind,
            path,
            token,
            tls_cert,
            tls_key,
            ice,
            connect_timeout,
            teardown_timeout,
        } => {
            let signaling = match (&tls_cert, &tls_key) {
                (Some(cert), Some(key)) => SignalingConfig::server_tls(cert, key),
                _ => SignalingConfig::server_default(),
            };

            let mut config = ListenerConfig::new(bind)
                .with_signaling_config(signaling)
                .with_path(&path)
                .with_rtc_config(ice.rtc_config(&[]))
                .with_connect_timeout(Duration::from_secs(connect_timeout))
                .with_teardown_timeout(Duration::from_secs(teardown_timeout));
            if let Some(token) = &token {
                config = config.with_token(token);
            } else {
                warn!("⚠️  No access token configured, any dialer can connect");
            }

            listen(config).await
        }
        Commands::Forward {
            dial,
            local,
            remote,
            network,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            let stored = ConfigManager::new()?.load()?;
            let (url, options) = dial.resolve(&stored)?;

            let listener = TcpListener::bind(local)
                .await
                .context(format!("Failed to bind {}", local))?;
            info!("Forwarding {} -> {} ({})", local, remote, network);

            let target = Arc::new(Target {
                network,
                address: remote,
            });
            let forward_task = tokio::spawn(forward_with_reconnect(
                url,
                options,
                listener,
                target,
                max_reconnect_attempts,
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
            ));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    Ok(())
                }
                result = forward_task => {
                    match result {
                        Ok(result) => result,
                        Err(e) => {
                            error!("Forward task panicked: {}", e);
                            Err(e.into())
                        }
                    }
                }
            }
        }
        Commands::Ping {
            dial,
            count,
            interval,
        } => {
            let stored = ConfigManager::new()?.load()?;
            let (url, options) = dial.resolve(&stored)?;
            ping(url, options, count, Duration::from_secs(interval)).await
        }
        Commands::ProbeIce {
            url,
            username,
            credential,
            insecure,
            timeout,
        } => {
            let mut server = IceServer::new(url);
            if let (Some(user), Some(pass)) = (username, credential) {
                server = server.with_credentials(user, pass);
            }
            let mut options = ProbeOptions::default().with_timeout(Duration::from_secs(timeout));
            if insecure {
                options = options.with_insecure_skip_verify();
            }
            probe_ice(server, options).await
        }
        Commands::Config { action } => handle_config(action),
    }
}
