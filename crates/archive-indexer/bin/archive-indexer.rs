use archive_indexer::Config;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // RUST_LOG takes precedence over the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level.into())
        .from_env_lossy()
        .add_directive("sled=warn".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let service = config.build()?;
    let cancellation_token = CancellationToken::new();
    let mut service_future = Box::pin(service.run(cancellation_token.clone()));

    let result = tokio::select! {
        result = &mut service_future => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C signal, initiating graceful shutdown");
            cancellation_token.cancel();
            service_future.await
        }
    };

    match &result {
        Ok(()) => tracing::info!("Archive indexer shutdown gracefully"),
        Err(e) => tracing::error!("Archive indexer encountered an error: {e:?}"),
    }
    result
}
