use anyhow::Context;

use cityscore_app::{Collaborators, Pipeline};
use cityscore_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cityscore_observability::init();

    let config = PipelineConfig::from_env().context("failed to load pipeline configuration")?;

    let collaborators = match std::env::var("DATABASE_URL") {
        Ok(url) => Collaborators::postgres(&url).await?,
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; logs and computations stay in memory");
            Collaborators::in_memory()
        }
    };

    let pipeline = Pipeline::start(config, collaborators)?;
    tracing::info!("pipeline running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    let report = pipeline.shutdown().await;
    tracing::info!(
        report = %serde_json::to_string(&report).context("failed to encode shutdown report")?,
        "shutdown complete"
    );
    Ok(())
}
