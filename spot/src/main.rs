use clap::Parser;
use tokio::signal;

use spot_match::{config, server};

#[derive(Parser, Debug)]
#[command(author, version, about = "spot order-matching service")]
struct Args {
    /// Path to the runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    config::RuntimeConfig::from_toml(&args.config);
    {
        server::instance().lock().await.start().await?;
    }
    shutdown_signal().await;
    {
        server::instance().lock().await.stop().await;
    }
    Ok(())
}
