use carlink::console::Console;
use carlink::mqtt::config::{ConnectionConfig, Credentials, DeliveryQuality, TransportKind};
use carlink::mqtt::link::RumqttcConnector;
use carlink::mqtt::registry::SessionRegistry;
use carlink::peer::HttpPeer;
use carlink::persistence::profile_store::{ProfileStore, DEFAULT_PROFILE};
use carlink::persistence::Profile;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Drive an ESP32 car over MQTT
#[derive(Parser, Debug)]
#[command(name = "carlink", version, about)]
struct Args {
    /// Stored profile to load
    #[arg(long, default_value = DEFAULT_PROFILE, env = "CARLINK_PROFILE")]
    profile: String,

    /// Device id of the vehicle
    #[arg(long, env = "CARLINK_DEVICE")]
    device: Option<String>,

    #[arg(long)]
    host: Option<String>,

    /// Broker port; defaults to the transport's usual port when --transport is given
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    #[arg(long, env = "CARLINK_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "CARLINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Delivery quality for every publish and subscription (0, 1 or 2)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: Option<u8>,

    /// Base URL of the vehicle's web server; commands then go over HTTP
    #[arg(long)]
    http: Option<String>,

    /// Do not connect to the broker on startup
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup()?;

    let store = ProfileStore::in_home_dir();
    store.ensure_default_profile().await?;
    let mut profile = store.load(&args.profile).await?;
    apply_overrides(&mut profile, &args)?;
    info!(
        "Profile {} for device {} via {}",
        args.profile,
        profile.device.device_id,
        profile.connection.broker_address()
    );

    let peer = args
        .http
        .as_deref()
        .map(HttpPeer::new)
        .transpose()
        .map_err(|e| eyre!("Failed to set up HTTP peer: {}", e))?;

    let registry = SessionRegistry::new(Arc::new(RumqttcConnector));
    let session = registry
        .session(&profile.device.device_id, profile.connection.clone())
        .await
        .map_err(|e| eyre!("Failed to create session: {}", e))?;

    if !args.offline {
        match session.connect().await {
            Ok(state) => info!("Session {} is {:?}", session.client_id(), state),
            Err(e) => warn!("Initial connect failed: {}", e),
        }
    }

    let console = Console::new(session, peer, store, args.profile.clone(), profile);
    let result = console.run().await;

    registry.shutdown().await;
    info!("carlink stopped");
    result
}

fn apply_overrides(profile: &mut Profile, args: &Args) -> Result<()> {
    let connection: &mut ConnectionConfig = &mut profile.connection;

    if let Some(device) = &args.device {
        profile.device.device_id = device.clone();
    }
    if let Some(host) = &args.host {
        connection.host = host.clone();
    }
    if let Some(transport) = args.transport {
        connection.transport = transport;
        connection.port = transport.default_port();
    }
    if let Some(port) = args.port {
        connection.port = port;
    }
    match (&args.username, &args.password) {
        (Some(username), password) => {
            connection.credentials = Some(Credentials {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            });
        }
        (None, Some(_)) => return Err(eyre!("--password needs --username")),
        (None, None) => {}
    }
    if let Some(level) = args.qos {
        connection.qos =
            DeliveryQuality::try_from(level).map_err(|e| eyre!("Invalid --qos: {}", e))?;
    }

    connection
        .validate()
        .map_err(|e| eyre!("Invalid connection settings: {}", e))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
