use bondhome_mqtt_bridge::config::{self, Config};
use bondhome_mqtt_bridge::error::BridgeError;
use bondhome_mqtt_bridge::mqtt::BondMqttIntegration;
use clap::Parser;
use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Relay Bond Home bridge state and commands to and from an MQTT broker.
///
/// Every option can also be set through the environment or a `.env` file.
#[derive(Parser, Debug)]
#[command(name = "bondhome-mqtt-bridge", version)]
struct Cli {
    /// Hostname or IP of the Bond bridge
    #[arg(long, env = "BOND_HOST")]
    bridge: Option<String>,

    /// Local API token of the bridge
    #[arg(long, env = "BOND_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// MQTT broker hostname
    #[arg(long, env = "MQTT_BROKER_HOST")]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT")]
    broker_port: Option<u16>,

    /// MQTT client id, defaults to the hostname
    #[arg(long, env = "MQTT_CLIENT_ID")]
    client_id: Option<String>,

    /// First segment of every topic
    #[arg(long, env = "MQTT_TOPIC_PREFIX")]
    topic_prefix: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(bridge) = self.bridge {
            config.bond.host = bridge;
        }
        if let Some(token) = self.token {
            config.bond.token = token;
        }
        if let Some(host) = self.broker_host {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = self.broker_port {
            config.mqtt.broker_port = port;
        }
        if let Some(client_id) = self.client_id {
            config.mqtt.client_id = client_id;
        }
        if let Some(prefix) = self.topic_prefix {
            config.relay.topic_prefix = prefix;
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    config::load_dotenv();
    init_logger();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Starting Bond Home MQTT bridge");
    info!("  Bridge: {}", config.bond.api_base_url());
    info!(
        "  Broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Topic prefix: {}", config.relay.topic_prefix);

    let shutdown = CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            shutdown.cancel();
        })
    };

    let result = BondMqttIntegration::new(config).run(shutdown).await;
    ctrl_c.abort();

    match result {
        Ok(()) => info!("Bond Home MQTT bridge stopped"),
        Err(e @ BridgeError::Keepalive(_)) => {
            error!("Lost contact with the bridge: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Fatal error: {}", e);
            std::process::exit(1);
        }
    }
}
