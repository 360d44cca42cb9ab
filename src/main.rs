use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use diffbot_zenoh_runtime::config::Config;

#[derive(Parser, Debug)]
#[command(name = "diffbot-zenoh-runtime")]
#[command(about = "Zenoh bridge for a differential-drive base on a serial motor controller", long_about = None)]
struct Args {
    /// TOML configuration file; defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port, overrides [serial].path
    #[arg(long)]
    port: Option<String>,

    /// Baud rate, overrides [serial].baud_rate
    #[arg(long)]
    baud: Option<u32>,
}

impl Args {
    fn load_config(&self) -> Result<Config, Box<dyn std::error::Error + Send + Sync>> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Config::from_file(path)?
            }
            None => Config::default(),
        };
        if let Some(port) = &self.port {
            config.serial.path = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = diffbot_zenoh_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
