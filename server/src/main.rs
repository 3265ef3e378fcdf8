use std::sync::Arc;

use anyhow::Context as _;

use git_cdn::config::{Config, display_url};
use git_cdn::http::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env()?);
    config.create_dirs().with_context(|| {
        format!(
            "failed to create workdir layout under {}",
            config.workdir.display()
        )
    })?;

    let state = AppState::new(config.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(
        bind = %config.bind,
        workdir = %config.workdir.display(),
        upstream = %display_url(&config.upstream),
        "git-cdn listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
