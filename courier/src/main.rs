use clap::Parser;
use courier::{App, Config, logger};
use std::{path::PathBuf, process::ExitCode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "COURIER_CONFIG",
        default_value = "/etc/courier/conf.d/courier.toml"
    )]
    config: PathBuf,

    /// Port of the HTTP server, overrides `app.port`
    #[arg(short, long, env = "COURIER_PORT")]
    port: Option<u16>,

    /// Log level, overrides `log.level`
    #[arg(long, env = "COURIER_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = match Config::new(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to initialize configuration: {:?}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.app.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }

    let _logger = logger::init(&config.log.level);
    tracing::debug!("Config path: {:?}", cli.config);

    let app = match App::new(&config) {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to start: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    match app.start().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}
