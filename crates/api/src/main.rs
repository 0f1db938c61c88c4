use anyhow::Context;

use edgepurge_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    edgepurge_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    let app = edgepurge_api::app::build_app(&config)
        .await
        .context("failed to wire application services")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
