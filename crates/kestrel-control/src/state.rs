use std::sync::Arc;

use anyhow::Context;
use kestrel_agent::{
    compiler::{CommandBundler, Compiler, CompilerOptions, ProjectApps},
    http_cache::{CacheClient, CacheError, HttpCache},
    platform,
    process_manager::{ProcessManager, ProcessManagerOptions},
    pubsub::Registry,
    settings::Settings,
};

use crate::config::ControlConfig;

/// Everything handlers need. Built once at startup; clones share state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub topics: Registry,
    pub processes: ProcessManager,
    pub http: CacheClient,
    pub compiler: Compiler,
}

impl AppState {
    pub async fn init(config: &ControlConfig) -> anyhow::Result<Self> {
        let settings = config.settings.clone();
        tokio::fs::create_dir_all(settings.data_dir())
            .await
            .with_context(|| format!("create {}", settings.data_dir().display()))?;

        let max_bytes = usize::try_from(settings.http_cache_max_bytes).unwrap_or(usize::MAX);
        let cache = match HttpCache::open(settings.http_cache_path(), max_bytes).await {
            Ok(cache) => cache,
            Err(e @ CacheError::Decode { .. }) => {
                tracing::warn!(error = %e, "discarding unreadable http cache");
                HttpCache::new(Some(settings.http_cache_path()), max_bytes)
            }
            Err(e) => return Err(e).context("open http cache"),
        };
        let client = reqwest::Client::builder()
            .user_agent(concat!("kestrel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        let http = CacheClient::new(Arc::new(cache), client);

        let topics = Registry::new(settings.subscriber_buffer);
        let processes = ProcessManager::open(
            ProcessManagerOptions::from_settings(&settings),
            platform::native(),
            topics.clone(),
        )
        .await
        .context("open process manager")?;

        let project = ProjectApps::open(&config.project_path, http.clone())
            .await
            .with_context(|| format!("load project at {}", config.project_path.display()))?;
        let bundler = CommandBundler::new(settings.bundler_command.clone(), settings.home.join("build"));
        let compiler = Compiler::new(
            Arc::new(project),
            Arc::new(bundler),
            http.clone(),
            processes.clone(),
            CompilerOptions::from_settings(&settings, config.bind.port()),
        );

        Ok(Self {
            settings: Arc::new(settings),
            topics,
            processes,
            http,
            compiler,
        })
    }
}
