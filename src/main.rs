// src/main.rs
use anyhow::Context;
use ridgeline::utils::{config::Config, logging};
use ridgeline::Application;
use tracing::info;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_tracing();

    let config = Config::from_env().context("loading configuration")?;

    info!("Starting ridgeline v{}", env!("CARGO_PKG_VERSION"));
    info!(
        ratio = config.matching.fp_ratio,
        min_base = config.matching.fp_min_base,
        min_percent = config.matching.fp_min_percent,
        abs_min_score = config.matching.fp_abs_min_score,
        margin_base = config.matching.fp_margin_base,
        sift_features = config.detector.fp_sift_features,
        workers = config.service.fp_max_workers,
        "matching configuration"
    );

    let app = Application::new(config)
        .await
        .context("initializing application")?;
    app.build_index().await;
    app.run().await.context("running API server")?;

    Ok(())
}
