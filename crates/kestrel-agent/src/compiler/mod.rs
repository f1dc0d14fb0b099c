//! Builds app bundles on demand and caches them per app.
//!
//! Each app has one build mutex. Client and server builds hold it for their
//! whole duration, so concurrent requests for the same app wait for a single
//! build instead of starting their own. A failed build leaves the previous
//! artifacts in place and the next request starts over.

pub mod app_config;
pub mod bundler;
pub mod command_bundler;
mod daemon;

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use kestrel_process::Identity;

pub use self::{
    app_config::{AppConfig, AppConfigError, AppConfigLoader, AppManifest, ProjectApps},
    bundler::{BuildFailure, BuildMessage, BuildOutput, BuildRequest, Bundler, EntrySource, Loader, Platform},
    command_bundler::CommandBundler,
    daemon::AppResponse,
};
use crate::{
    error::{Classify, ErrorKind},
    http_cache::CacheClient,
    process_manager::{ProcessError, ProcessManager},
    settings::Settings,
};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Build(#[from] BuildFailure),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("failed to prepare {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start app server for {app_id}: {reason}")]
    ServerStart { app_id: String, reason: &'static str },
    #[error("app server for {app_id} is not running")]
    NotRunning { app_id: String },
    #[error("request to app server for {app_id} failed")]
    Request {
        app_id: String,
        #[source]
        source: reqwest::Error,
    },
}

impl Classify for CompileError {
    fn kind(&self) -> ErrorKind {
        match self {
            CompileError::Config(e) => e.kind(),
            CompileError::Build(_) => ErrorKind::BuildFailure,
            CompileError::Process(e) => e.kind(),
            CompileError::NotRunning { .. } => ErrorKind::NotFound,
            CompileError::Io { .. } | CompileError::ServerStart { .. } | CompileError::Request { .. } => {
                ErrorKind::IoFailure
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Port of the control plane, baked into bundles.
    pub server_port: u16,
    /// Working directories for remote apps' daemons.
    pub app_cache_dir: PathBuf,
    pub node_command: String,
    pub keep_alive_interval: Duration,
    pub cache_enabled: bool,
}

impl CompilerOptions {
    pub fn from_settings(settings: &Settings, server_port: u16) -> Self {
        Self {
            server_port,
            app_cache_dir: settings.app_cache_dir(),
            node_command: settings.node_command.clone(),
            keep_alive_interval: settings.keep_alive_interval,
            cache_enabled: settings.cache_enabled,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Artifacts {
    html: Option<String>,
    client_js: Option<String>,
    client_metafile: serde_json::Value,
    server_js: Option<String>,
    server_exports: BTreeMap<String, Vec<String>>,
}

/// One app's cache entry. Artifacts are filled in lazily by the first build.
#[derive(Debug)]
pub struct CompiledApp {
    id: String,
    process_id: Identity,
    config: AppConfig,
    should_cache: bool,
    build: tokio::sync::Mutex<Artifacts>,
    /// Set once a client bundle has been stored in `build`.
    client_ready: AtomicBool,
    keep_alive_running: AtomicBool,
}

impl CompiledApp {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn process_id(&self) -> &Identity {
        &self.process_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub fn keep_alive_running(&self) -> bool {
        self.keep_alive_running.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedClient {
    pub html: String,
    pub cache_hit: bool,
}

#[derive(Clone)]
pub struct Compiler {
    inner: Arc<CompilerInner>,
}

struct CompilerInner {
    apps: Mutex<HashMap<String, Arc<CompiledApp>>>,
    loader: Arc<dyn AppConfigLoader>,
    bundler: Arc<dyn Bundler>,
    http: CacheClient,
    processes: ProcessManager,
    options: CompilerOptions,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("project", &self.inner.loader.project_name())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    pub fn new(
        loader: Arc<dyn AppConfigLoader>,
        bundler: Arc<dyn Bundler>,
        http: CacheClient,
        processes: ProcessManager,
        options: CompilerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CompilerInner {
                apps: Mutex::new(HashMap::new()),
                loader,
                bundler,
                http,
                processes,
                options,
            }),
        }
    }

    pub fn project_name(&self) -> &str {
        self.inner.loader.project_name()
    }

    pub async fn list_apps(&self) -> Result<Vec<AppConfig>, CompileError> {
        Ok(self.inner.loader.list().await?)
    }

    pub async fn load_app(&self, id: &str) -> Result<AppConfig, CompileError> {
        Ok(self.inner.loader.load(id).await?)
    }

    /// Looks up or creates the cache entry for `id`. Never builds anything.
    /// The flag is true when the entry holds a reusable client bundle.
    pub async fn get_app(&self, id: &str) -> Result<(Arc<CompiledApp>, bool), CompileError> {
        if let Some(app) = self.cached(id) {
            let hit = app.should_cache && app.client_ready.load(Ordering::Acquire);
            return Ok((app, hit));
        }

        let config = self.inner.loader.load(id).await?;
        let app = Arc::new(CompiledApp {
            id: id.to_string(),
            process_id: Identity::from_parts(["app", self.project_name()], id),
            should_cache: !config.is_file_backed() && self.inner.options.cache_enabled,
            config,
            build: tokio::sync::Mutex::new(Artifacts::default()),
            client_ready: AtomicBool::new(false),
            keep_alive_running: AtomicBool::new(false),
        });

        let mut apps = self.inner.apps.lock().unwrap_or_else(PoisonError::into_inner);
        // Another request may have loaded the same app meanwhile.
        let app = apps.entry(id.to_string()).or_insert(app).clone();
        Ok((app, false))
    }

    fn cached(&self, id: &str) -> Option<Arc<CompiledApp>> {
        self.inner
            .apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Drops the cache entry, so the next request reloads config and rebuilds.
    pub fn reset_app_cache(&self, id: &str) -> bool {
        let removed = self
            .inner
            .apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            tracing::info!(app_id = id, "app cache reset");
        }
        removed
    }

    fn defines(&self, app: &CompiledApp) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "process.env.KESTREL_SERVER_PORT".to_string(),
                self.inner.options.server_port.to_string(),
            ),
            (
                "process.env.KESTREL_APP_ID".to_string(),
                serde_json::Value::String(app.id.clone()).to_string(),
            ),
        ])
    }

    /// Builds the client bundle into `artifacts` unless a reusable one exists.
    /// Returns true when the existing bundle was reused.
    async fn ensure_client(&self, app: &CompiledApp, artifacts: &mut Artifacts) -> Result<bool, CompileError> {
        if app.should_cache && artifacts.client_js.is_some() {
            return Ok(true);
        }

        let config = &app.config;
        let (page_url, contents) = config.read_file(&self.inner.http, &config.manifest.page).await?;
        let resolve_dir = page_url
            .to_file_path()
            .ok()
            .and_then(|p| p.parent().map(|d| d.to_path_buf()));
        let request = BuildRequest {
            app_id: app.id.clone(),
            entry: EntrySource {
                contents,
                source_file: page_url.to_string(),
                resolve_dir,
                loader: Loader::Tsx,
            },
            platform: Platform::Browser,
            defines: self.defines(app),
            base_url: config.config_url.clone(),
            fetcher: self.inner.http.clone(),
        };

        let started = std::time::Instant::now();
        let output = self.inner.bundler.build(request).await.inspect_err(|e| {
            tracing::warn!(app_id = %app.id, errors = e.messages.len(), "client build failed");
        })?;
        tracing::info!(
            app_id = %app.id,
            bytes = output.code.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "client bundle built"
        );

        artifacts.html = Some(render_html(&config.manifest, &output.code));
        artifacts.client_js = Some(output.code);
        artifacts.client_metafile = output.metafile;
        artifacts.server_exports = output.server_exports;
        app.client_ready.store(true, Ordering::Release);
        Ok(false)
    }

    /// The app's client artifacts, and whether they came from the cache.
    async fn build_client(&self, app: &CompiledApp) -> Result<(Artifacts, bool), CompileError> {
        let mut artifacts = app.build.lock().await;
        let reused = self.ensure_client(app, &mut artifacts).await?;
        Ok((artifacts.clone(), reused))
    }

    /// Builds the daemon bundle. The client build runs first because it is
    /// what discovers the app's server modules.
    async fn build_server(&self, app: &CompiledApp) -> Result<String, CompileError> {
        let mut artifacts = app.build.lock().await;
        if app.should_cache {
            if let Some(js) = &artifacts.server_js {
                return Ok(js.clone());
            }
        }
        self.ensure_client(app, &mut artifacts).await?;

        let request = BuildRequest {
            app_id: app.id.clone(),
            entry: EntrySource {
                contents: bundler::server_entrypoint(&artifacts.server_exports),
                source_file: "server-rpc-methods.js".to_string(),
                resolve_dir: app.config.local_dir(),
                loader: Loader::Js,
            },
            platform: Platform::Node,
            defines: self.defines(app),
            base_url: app.config.config_url.clone(),
            fetcher: self.inner.http.clone(),
        };
        let output = self.inner.bundler.build(request).await.inspect_err(|e| {
            tracing::warn!(app_id = %app.id, errors = e.messages.len(), "server build failed");
        })?;
        tracing::info!(app_id = %app.id, bytes = output.code.len(), "server bundle built");

        artifacts.server_js = Some(output.code.clone());
        Ok(output.code)
    }

    /// The app's HTML shell with the client bundle inlined.
    pub async fn render_client(&self, id: &str) -> Result<RenderedClient, CompileError> {
        let (app, _) = self.get_app(id).await?;
        let (artifacts, cache_hit) = self.build_client(&app).await?;
        Ok(RenderedClient {
            html: artifacts.html.unwrap_or_default(),
            cache_hit,
        })
    }

    pub async fn client_bundle(&self, id: &str) -> Result<String, CompileError> {
        let (app, _) = self.get_app(id).await?;
        Ok(self.build_client(&app).await?.0.client_js.unwrap_or_default())
    }

    pub async fn client_metafile(&self, id: &str) -> Result<serde_json::Value, CompileError> {
        let (app, _) = self.get_app(id).await?;
        Ok(self.build_client(&app).await?.0.client_metafile)
    }

    pub async fn server_bundle(&self, id: &str) -> Result<String, CompileError> {
        let (app, _) = self.get_app(id).await?;
        self.build_server(&app).await
    }

    /// Warms the client bundle in the background and resumes watching an
    /// app server left running by an earlier run. No-op with caching off.
    pub async fn precompile(&self, id: &str) -> Result<(), CompileError> {
        if !self.inner.options.cache_enabled {
            return Ok(());
        }
        let (app, _) = self.get_app(id).await?;

        let compiler = self.clone();
        let warm = app.clone();
        tokio::spawn(async move {
            if let Err(e) = compiler.build_client(&warm).await {
                tracing::warn!(app_id = %warm.id, error = %e, "precompile failed");
            }
        });

        if self.is_alive(&app).await {
            self.start_keep_alive(&app);
        }
        Ok(())
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn render_html(manifest: &AppManifest, client_js: &str) -> String {
    let title = escape_html(if manifest.name.is_empty() { &manifest.id } else { &manifest.name });
    let icon = escape_html(&manifest.page_icon);
    // An inline script ends at the first `</script`, whatever its case.
    let script = client_js.replace("</script", "<\\/script").replace("</SCRIPT", "<\\/SCRIPT");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8" />
<meta name="viewport" content="width=device-width, initial-scale=1" />
<title>{title}</title>
<link rel="icon" href="data:image/svg+xml,<svg xmlns=%22http://www.w3.org/2000/svg%22 viewBox=%220 0 100 100%22><text y=%22.9em%22 font-size=%2290%22>{icon}</text></svg>" />
</head>
<body>
<div id="root"></div>
<script type="module">{script}</script>
</body>
</html>
"#
    )
}
