//! tailcast — stream deployment log files to websocket and SSE clients.

use tailcast_server::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse_args().into_config();
    log::info!(
        "tailcast {} starting (log dir {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.log_dir.display()
    );

    tailcast_server::run(config).await?;
    Ok(())
}
