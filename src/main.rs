use anyhow::{bail, Result};
use blueboy_config::AppConfig;
use blueboy_imu::connection::ConnectionState;
use blueboy_imu::ImuClient;
use std::time::Duration;
use tracing::{info, warn};

/// How often the latest orientation is printed.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blueboy_monitor=info,blueboy_imu=info".into()),
        )
        .init();

    info!("Blueboy attitude monitor starting");

    // Load config.
    let config = blueboy_config::load_config().unwrap_or_else(|e| {
        warn!(?e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    let port = std::env::args().nth(1);
    let serial = config.serial_settings(port);
    let options = config.session_options()?;
    info!(
        port = %serial.port,
        period_ms = options.period_ms,
        beta = options.filter.beta,
        fusion = ?options.filter.mode,
        "Config loaded"
    );

    let client = ImuClient::connect(serial, options)?;
    let result = report_until_interrupted(&client).await;

    info!(stats = ?client.stats(), "Shutting down");
    client.shutdown();
    result
}

/// Log the latest orientation until Ctrl-C or the connection gives up.
async fn report_until_interrupted(client: &ImuClient) -> Result<()> {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("Interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                match client.connection_state() {
                    ConnectionState::Connected => {
                        let orientation = client.orientation();
                        let [w, x, y, z] = orientation.components();
                        let (roll, pitch, yaw) = orientation.euler_angles();
                        info!(
                            w, x, y, z,
                            roll = roll.to_degrees(),
                            pitch = pitch.to_degrees(),
                            yaw = yaw.to_degrees(),
                            "Orientation"
                        );
                    }
                    ConnectionState::Failed { reason } => bail!("IMU connection failed: {reason}"),
                    state => info!(?state, "Waiting for IMU"),
                }
            }
        }
    }
}
