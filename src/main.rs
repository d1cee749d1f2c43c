use echoplex::config::Config;
use echoplex::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        max_connections = config.max_connections,
        frame_size = config.frame_size,
        "Starting echoplex server"
    );

    runtime::run(config)?;

    info!("Server done");
    Ok(())
}
