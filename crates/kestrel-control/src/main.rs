use kestrel_control::{config::ControlConfig, state::AppState};

/// Builds every app of the project in the background, so the first page
/// load finds warm artifacts.
fn spawn_precompile(state: &AppState) {
    let compiler = state.compiler.clone();
    tokio::spawn(async move {
        let apps = match compiler.list_apps().await {
            Ok(apps) => apps,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list apps for precompile");
                return;
            }
        };
        for app in apps {
            let id = app.id().to_string();
            match compiler.precompile(&id).await {
                Ok(()) => tracing::debug!(app_id = %id, "app precompile started"),
                Err(e) => tracing::warn!(app_id = %id, error = %e, "app precompile failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ControlConfig::from_env()?;
    let state = AppState::init(&config).await?;
    spawn_precompile(&state);

    let app = kestrel_control::router(state.clone());
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(
        addr = %config.bind,
        project = %config.project_path.display(),
        home = %state.settings.home.display(),
        "kestrel-control HTTP listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Supervised processes keep running; only the fetch cache needs flushing.
    if let Err(e) = state.http.save().await {
        tracing::warn!(error = %e, "failed to save http cache");
    }
    Ok(())
}
