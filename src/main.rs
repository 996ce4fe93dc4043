use std::env;
use std::io::{self, BufRead};

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iot_device_console_rs::config::{self, DeviceConfig};
use iot_device_console_rs::console::Console;
use iot_device_console_rs::hub::IotHubClient;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let connection_string = match env::var(config::CONNECTION_STRING_VAR) {
        Ok(value) => value,
        Err(_) => {
            println!("Please enter the device connection string:");
            let mut line = String::new();
            if let Err(e) = io::stdin().lock().read_line(&mut line) {
                error!(error = %e, "failed to read the connection string");
                return;
            }
            line.trim().to_string()
        }
    };

    let config = match DeviceConfig::from_connection_string(&connection_string) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid device connection string");
            return;
        }
    };

    info!(
        hostname = %config.hostname,
        device_id = %config.device_id,
        "device console starting"
    );

    let mut client = match IotHubClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to create the hub client");
            return;
        }
    };

    // a failed connection is fatal; the menu never shows without a session
    if client.connect(&config).await.is_err() {
        return;
    }

    let stdin = io::stdin();
    let mut console = Console::new(stdin.lock(), io::stdout());
    if let Err(e) = console.run(&mut client, &config).await {
        error!(error = %e, "console session failed");
    }

    client.disconnect().await;
}
