use clap::Parser;
use tracing::{error, info};

use steward::{Cli, Config, Server};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("steward=info")),
        )
        .init();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(1);
        }
    };

    info!(
        node = %config.node_name,
        central = %config.central_node_name,
        broker = %config.broker_address,
        "configuration loaded"
    );

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
