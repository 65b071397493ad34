use tracing_subscriber::EnvFilter;

use solace::config::ServiceConfig;
use solace::runtime::ServiceRuntime;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solace=debug")),
        )
        .init();

    tracing::info!("Solace mental health service starting...");

    let config = ServiceConfig::load();

    let runtime = match ServiceRuntime::bootstrap(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Bootstrap failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.serve().await {
        tracing::error!("Server error: {:#}", e);
        std::process::exit(1);
    }
}
