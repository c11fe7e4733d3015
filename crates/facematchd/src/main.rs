use anyhow::Result;
use facematchd::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facematchd=info,facematch_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        cascade = %config.cascade_path.display(),
        db = %config.db_path.display(),
        "facematchd starting"
    );

    facematchd::start_server(config).await
}
