//! Print value metrics from a Cloud Foundry firehose
//!
//! Run with:
//!   DOPPLER_ADDR=wss://doppler.example.com:443 UAA_ADDR=https://uaa.example.com \
//!   CF_USERNAME=admin CF_PASSWORD=secret cargo run --example firehose -- --insecure

use clap::Parser;
use firehose_nozzle::{Config, Consumer, Envelope, EventType};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "firehose", about = "Print value metrics from the firehose")]
struct Cli {
    /// Doppler websocket address
    #[arg(long, env = "DOPPLER_ADDR")]
    doppler_addr: String,

    /// Bearer token; skips the UAA fetch when set
    #[arg(long, env = "CF_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "UAA_ADDR")]
    uaa_addr: Option<String>,

    #[arg(long, env = "CF_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "CF_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, default_value = "firehose-nozzle-example")]
    subscription_id: String,

    /// Skip TLS verification
    #[arg(long)]
    insecure: bool,

    /// Seconds to wait for the UAA token
    #[arg(long, default_value_t = 60)]
    auth_timeout_secs: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::new(&self.doppler_addr, &self.subscription_id)
            .with_insecure(self.insecure)
            .with_auth_timeout(Duration::from_secs(self.auth_timeout_secs));
        config.token = self.token.clone();
        config.uaa_addr = self.uaa_addr.clone();
        config.username = self.username.clone();
        config.password = self.password.clone();
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut consumer = match Consumer::connect(cli.config()).await {
        Ok(consumer) => consumer,
        Err(e) => {
            tracing::error!("Failed to construct nozzle consumer: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = consumer.start() {
        tracing::error!("Failed to start nozzle consumer: {}", e);
        return ExitCode::FAILURE;
    }

    let (Some(mut events), Some(mut alerts), Some(mut errors)) =
        (consumer.events(), consumer.alerts(), consumer.errors())
    else {
        tracing::error!("Consumer started without streams");
        return ExitCode::FAILURE;
    };

    tracing::info!("Reading value metrics");
    let (mut events_open, mut alerts_open, mut errors_open) = (true, true, true);
    while events_open || alerts_open || errors_open {
        tokio::select! {
            received = events.recv(), if events_open => match received {
                Some(envelope) => log_value_metric(envelope),
                None => events_open = false,
            },
            received = alerts.recv(), if alerts_open => match received {
                Some(alert) => tracing::warn!("Detected slow consumer: {}", alert),
                None => alerts_open = false,
            },
            received = errors.recv(), if errors_open => match received {
                Some(err) => {
                    tracing::error!("Failed to consume firehose events: {}", err);
                    break;
                }
                None => errors_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
        }
    }

    tracing::info!("Closing nozzle consumer");
    if let Err(e) = consumer.close() {
        tracing::error!("Failed to close nozzle consumer: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn log_value_metric(envelope: Envelope) {
    if envelope.kind() != Some(EventType::ValueMetric) {
        return;
    }
    if let Some(metric) = envelope.value_metric {
        tracing::info!(
            origin = envelope.origin.as_deref().unwrap_or_default(),
            name = metric.name.as_deref().unwrap_or_default(),
            value = metric.value.unwrap_or_default(),
            unit = metric.unit.as_deref().unwrap_or_default(),
            "ValueMetric"
        );
    }
}
