//! Wearlink command-line front end
//!
//! Scans for wearables and streams their samples as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! # List nearby devices (in-memory demo radio)
//! wearlink devices
//!
//! # Real Bluetooth (build with --features ble)
//! wearlink --transport ble devices --hint galaxy
//!
//! # Stream PPG for 30 seconds, retrying the connection up to 3 times
//! wearlink monitor --device "Galaxy Watch 5" --metric ppg --seconds 30 --retries 3
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wearlink_core::error::ConnectError;
use wearlink_core::protocol::HEART_RATE_MEASUREMENT_UUID;
use wearlink_core::types::{DeviceDescriptor, DeviceId, Metric, Session};
use wearlink_native::bridge::{BleTransport, MockPeripheral, MockTransport};
use wearlink_native::{Acquisition, AcquisitionConfig};

/// Wearlink
#[derive(Parser, Debug)]
#[command(name = "wearlink")]
#[command(author, version, about = "Wearable biosensor acquisition", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bluetooth transport
    #[arg(short, long, value_enum, default_value = "mock")]
    transport: TransportArg,

    /// Override the scan window (ms)
    #[arg(long)]
    scan_ms: Option<u64>,

    /// Disable simulated fallback samples
    #[arg(long)]
    no_simulation: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    /// In-memory demo radio
    Mock,
    /// Host Bluetooth adapter
    Ble,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum MetricArg {
    HeartRate,
    Ecg,
    Ppg,
    Battery,
}

impl From<MetricArg> for Metric {
    fn from(value: MetricArg) -> Self {
        match value {
            MetricArg::HeartRate => Metric::HeartRate,
            MetricArg::Ecg => Metric::Ecg,
            MetricArg::Ppg => Metric::Ppg,
            MetricArg::Battery => Metric::Battery,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List nearby wearables
    Devices {
        /// Only names containing this (case-insensitive)
        #[arg(long)]
        hint: Option<String>,
    },

    /// Stream samples from one device
    Monitor {
        /// Device id, or part of its advertised name
        #[arg(short, long)]
        device: String,

        /// Metric to stream
        #[arg(short, long, value_enum, default_value = "heart-rate")]
        metric: MetricArg,

        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Connection attempts after the first
        #[arg(short, long, default_value = "2")]
        retries: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Samples go to stdout, logs to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Wearlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => AcquisitionConfig::from_file(path)?,
        None => AcquisitionConfig::default(),
    };
    if let Some(scan_ms) = cli.scan_ms {
        config.scan_window_ms = scan_ms;
    }
    if cli.no_simulation {
        config.simulation_fallback = false;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let transport = open_transport(cli.transport).await?;
        let acquisition = Acquisition::new(transport, config)?;

        match cli.command {
            Commands::Devices { hint } => list_devices(&acquisition, hint.as_deref()).await,
            Commands::Monitor {
                device,
                metric,
                seconds,
                retries,
            } => {
                let policy = RetryPolicy {
                    retries,
                    ..RetryPolicy::default()
                };
                monitor(&acquisition, &device, metric.into(), seconds, &policy).await
            }
        }
    })
}

async fn open_transport(kind: TransportArg) -> anyhow::Result<Arc<dyn BleTransport>> {
    match kind {
        TransportArg::Mock => {
            info!("Using in-memory demo radio");
            Ok(Arc::new(demo_radio()))
        }
        TransportArg::Ble => {
            #[cfg(feature = "ble")]
            {
                let transport = wearlink_native::BtleplugTransport::new().await?;
                Ok(Arc::new(transport))
            }

            #[cfg(not(feature = "ble"))]
            {
                anyhow::bail!(
                    "Bluetooth transport not enabled. Rebuild with --features ble:\n\
                     cargo run -p wearlink-app --features ble"
                );
            }
        }
    }
}

/// Demo radio with a few wearables and a strap that beats at ~72 bpm.
fn demo_radio() -> MockTransport {
    let transport = MockTransport::with_peripherals([
        MockPeripheral::galaxy_watch("demo-galaxy", "Galaxy Watch 5"),
        MockPeripheral::apple_watch("demo-apple", "Apple Watch Series 9"),
        MockPeripheral::heart_rate_strap("demo-strap", "Polar H10"),
    ]);

    let beat = transport.clone();
    tokio::spawn(async move {
        let strap = DeviceId::from("demo-strap");
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        for bpm in (68u8..=76).chain((69u8..=75).rev()).cycle() {
            interval.tick().await;
            beat.notify(&strap, HEART_RATE_MEASUREMENT_UUID, &[0x00, bpm]);
        }
    });

    transport
}

async fn list_devices(acquisition: &Acquisition, hint: Option<&str>) -> anyhow::Result<()> {
    let devices = acquisition.scan(hint).await?;
    for device in &devices {
        println!("{}", serde_json::to_string(device)?);
    }
    info!("{} devices found", devices.len());
    Ok(())
}

/// Pick a scanned device by exact id or by name fragment.
fn select_device<'a>(devices: &'a [DeviceDescriptor], query: &str) -> Option<&'a DeviceDescriptor> {
    let needle = query.to_lowercase();
    devices.iter().find(|d| d.id.as_str() == query).or_else(|| {
        devices
            .iter()
            .find(|d| d.label().to_lowercase().contains(&needle))
    })
}

async fn monitor(
    acquisition: &Acquisition,
    query: &str,
    metric: Metric,
    seconds: Option<u64>,
    policy: &RetryPolicy,
) -> anyhow::Result<()> {
    let devices = acquisition.scan(None).await?;
    let device = select_device(&devices, query)
        .ok_or_else(|| anyhow::anyhow!("No scanned device matches {:?}", query))?
        .clone();

    info!(
        "Selected {} ({}, {})",
        device.label(),
        device.id,
        device.vendor_profile
    );
    policy.connect(acquisition, &device.id).await?;

    let handle = acquisition
        .start_monitoring(&device.id, metric, |sample| {
            match serde_json::to_string(&sample) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to encode sample: {}", e),
            }
        })
        .await?;

    match seconds {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    acquisition.stop_monitoring(&handle).await;
    acquisition.shutdown().await;
    Ok(())
}

// ============================================================================
// Connection retry
// ============================================================================

/// Caller-side connection retry with exponential backoff.
#[derive(Clone, Debug)]
struct RetryPolicy {
    retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Transient failures worth another attempt.
    fn is_retryable(err: &ConnectError) -> bool {
        matches!(
            err,
            ConnectError::Timeout(_) | ConnectError::LinkLost | ConnectError::Transport(_)
        )
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn connect(
        &self,
        acquisition: &Acquisition,
        device_id: &DeviceId,
    ) -> Result<Session, ConnectError> {
        let mut attempt = 0;
        loop {
            match acquisition.connect(device_id).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < self.retries && Self::is_retryable(&e) => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "Connect attempt {} failed: {}; retrying in {} ms",
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
