mod config;
mod credentials;
mod models;
mod mqtt_service;

use crate::config::Config;
use crate::credentials::CredentialBundle;
use crate::models::GeneratorProfile;
use crate::mqtt_service::{LogConnectionEvents, MqttService};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };
    info!(
        "Starting factory telemetry simulator for machine '{}'",
        config.machine_id
    );

    // Credentials must load before any connection is attempted; a broken
    // bundle is fatal, there is no partial operation mode.
    let bundle = match CredentialBundle::load(
        &config.root_ca_path,
        &config.cert_path,
        &config.private_key_path,
    ) {
        Ok(bundle) => bundle,
        Err(e) => {
            error!("Failed to load device credentials: {}", e);
            process::exit(1);
        }
    };

    let tls = match bundle.client_tls_config() {
        Ok(tls) => tls,
        Err(e) => {
            error!("Failed to build TLS client context: {}", e);
            process::exit(1);
        }
    };

    let profile = GeneratorProfile::from_config(&config);
    let service = MqttService::new(config, Arc::new(LogConnectionEvents));

    if let Err(e) = service.clone().connect(tls).await {
        error!("Could not connect to the broker: {}", e);
        process::exit(1);
    }

    // Runs until the process is terminated externally.
    if let Err(e) = service.run(profile).await {
        error!("Telemetry loop failed: {}", e);
        process::exit(1);
    }
}
