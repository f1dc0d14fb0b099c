//! App server lifecycle: start, watch, stop and call into an app's daemon.

use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use kestrel_process::{HealthCheckSpec, ProcessConfig, escape_segment};

use super::{CompileError, CompiledApp, Compiler};
use crate::{port_alloc::allocate_tcp_port, process_manager::ProcessError};

const DAEMON_RUNNER: &str = include_str!("daemon-runner.js");
const RUNNER_FILE: &str = "kestrel-daemon-runner.js";
const BUNDLE_FILE: &str = "daemon.bundle.js";

const READY_ATTEMPTS: usize = 10;
const READY_INTERVAL: Duration = Duration::from_millis(500);
const KEEP_ALIVE_STRIKES: u32 = 3;

/// What an app daemon answered.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppResponse {
    pub status_code: u16,
    pub body: String,
}

impl AppResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Rejects absolute paths and `..`, so remote file lists stay inside the
/// app directory.
fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative.trim_start_matches("./"));
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (out != root).then_some(out)
}

impl Compiler {
    /// Whether the app's server answers its health check.
    pub async fn is_alive(&self, app: &CompiledApp) -> bool {
        self.inner.processes.check_health(&app.process_id).await
    }

    pub async fn app_is_alive(&self, id: &str) -> Result<bool, CompileError> {
        let (app, _) = self.get_app(id).await?;
        Ok(self.is_alive(&app).await)
    }

    /// Starts the keep-alive monitor unless one is already watching `app`.
    pub fn start_keep_alive(&self, app: &Arc<CompiledApp>) -> bool {
        if app
            .keep_alive_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tokio::spawn(self.clone().keep_alive(app.clone()));
        true
    }

    /// Watches the app's health until it fails three times in a row. Never
    /// kills anything; a dead server is respawned by the next request.
    async fn keep_alive(self, app: Arc<CompiledApp>) {
        let interval = self.inner.options.keep_alive_interval;
        let mut strikes = 0;
        loop {
            if self.is_alive(&app).await {
                strikes = 0;
            } else {
                strikes += 1;
                if strikes >= KEEP_ALIVE_STRIKES {
                    tracing::warn!(app_id = %app.id, "app server shut down");
                    break;
                }
            }
            tokio::time::sleep(interval).await;
        }
        app.keep_alive_running.store(false, Ordering::Release);
    }

    fn runner_dir(&self, app: &CompiledApp) -> PathBuf {
        self.inner
            .options
            .app_cache_dir
            .join(escape_segment(self.project_name()))
            .join(escape_segment(&app.id))
    }

    async fn write_file(path: &Path, contents: &str) -> Result<(), CompileError> {
        let io = |source| CompileError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(path, contents).await.map_err(io)
    }

    /// Copies a remote app's declared files next to its daemon.
    async fn copy_app_files(&self, app: &CompiledApp, dir: &Path) -> Result<(), CompileError> {
        if app.config.is_file_backed() {
            return Ok(());
        }
        for file in &app.config.manifest.files {
            let Some(target) = contained_path(dir, file) else {
                return Err(CompileError::ServerStart {
                    app_id: app.id.clone(),
                    reason: "app file escapes the app directory",
                });
            };
            let (_, contents) = app.config.read_file(&self.inner.http, file).await?;
            Self::write_file(&target, &contents).await?;
        }
        Ok(())
    }

    /// Prepares everything needed to spawn the app's daemon. Runs without the
    /// process store lock, since it may build the server bundle.
    async fn daemon_config(&self, app: &CompiledApp) -> Result<ProcessConfig, CompileError> {
        let runner_dir = self.runner_dir(app);
        let work_dir = app.config.local_dir().unwrap_or_else(|| runner_dir.clone());
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|source| CompileError::Io {
                path: work_dir.clone(),
                source,
            })?;
        self.copy_app_files(app, &work_dir).await?;

        let port = allocate_tcp_port(0).map_err(|source| CompileError::Io {
            path: PathBuf::from("127.0.0.1:0"),
            source,
        })?;

        let mut env = BTreeMap::from([
            ("KESTREL_APP_ID".to_string(), app.id.clone()),
            ("KESTREL_PROCESS_TYPE".to_string(), "daemon".to_string()),
            (
                "KESTREL_PROJECT_PATH".to_string(),
                self.inner.loader.project_path().display().to_string(),
            ),
            ("PORT".to_string(), port.to_string()),
        ]);

        let (command, args) = match &app.config.manifest.daemon {
            Some(daemon) => {
                let Some((command, args)) = daemon.split_first() else {
                    return Err(CompileError::ServerStart {
                        app_id: app.id.clone(),
                        reason: "daemon command is empty",
                    });
                };
                (command.clone(), args.to_vec())
            }
            None => {
                let server_js = self.build_server(app).await?;
                let bundle_path = runner_dir.join(BUNDLE_FILE);
                let runner_path = runner_dir.join(RUNNER_FILE);
                Self::write_file(&bundle_path, &server_js).await?;
                Self::write_file(&runner_path, DAEMON_RUNNER).await?;
                env.insert(
                    "KESTREL_DAEMON_TARGET".to_string(),
                    bundle_path.display().to_string(),
                );
                (
                    self.inner.options.node_command.clone(),
                    vec![runner_path.display().to_string()],
                )
            }
        };

        let mut config = ProcessConfig::new(app.process_id.clone(), command);
        config.args = args;
        config.env = env;
        config.port = port;
        config.health_check = Some(HealthCheckSpec::http_get(format!(
            "http://127.0.0.1:{port}/api/health"
        )));

        // Relative daemon paths are relative to the app, bare names come from PATH.
        if Path::new(&config.command).components().count() > 1 && Path::new(&config.command).is_relative() {
            config.command = work_dir.join(&config.command).display().to_string();
        }
        config.work_dir = Some(work_dir);
        Ok(config)
    }

    pub async fn start_server(&self, id: &str) -> Result<(), CompileError> {
        let (app, _) = self.get_app(id).await?;
        self.start_app_server(&app).await
    }

    async fn start_app_server(&self, app: &Arc<CompiledApp>) -> Result<(), CompileError> {
        let processes = &self.inner.processes;
        if processes.is_alive(&app.process_id).await {
            return Ok(());
        }

        let config = self.daemon_config(app).await?;
        let bare_command = Path::new(&config.command).components().count() == 1;
        let outcome = {
            let mut w = processes.write_handle().await;
            if bare_command {
                w.spawn_from_path_var(config).await?
            } else {
                w.spawn(config).await?
            }
        };
        let pid = outcome.record().pid;
        if outcome.already_running() {
            tracing::debug!(app_id = %app.id, pid, "app server already running");
        }

        for _ in 0..READY_ATTEMPTS {
            if !processes.is_alive(&app.process_id).await {
                tracing::warn!(app_id = %app.id, pid, "app server exited during startup");
                return Err(CompileError::ServerStart {
                    app_id: app.id.clone(),
                    reason: "process died",
                });
            }
            if processes.check_health(&app.process_id).await {
                tracing::info!(app_id = %app.id, pid, "app server ready");
                self.start_keep_alive(app);
                return Ok(());
            }
            tracing::debug!(app_id = %app.id, pid, "app server not ready yet");
            tokio::time::sleep(READY_INTERVAL).await;
        }

        tracing::warn!(app_id = %app.id, pid, "stopping unhealthy app server");
        if let Err(e) = self.stop_app_server(app).await {
            tracing::warn!(app_id = %app.id, pid, error = %e, "failed to stop unhealthy app server");
        }
        Err(CompileError::ServerStart {
            app_id: app.id.clone(),
            reason: "process did not become ready",
        })
    }

    async fn stop_app_server(&self, app: &CompiledApp) -> Result<(), CompileError> {
        match self.inner.processes.kill(&app.process_id).await {
            Ok(()) | Err(ProcessError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stops the app's server. Not running is fine.
    pub async fn stop_server(&self, id: &str) -> Result<(), CompileError> {
        let (app, _) = self.get_app(id).await?;
        self.stop_app_server(&app).await
    }

    pub async fn restart_app(&self, id: &str) -> Result<(), CompileError> {
        let (app, _) = self.get_app(id).await?;
        self.stop_app_server(&app).await?;
        self.start_app_server(&app).await
    }

    /// Sends a JSON request to the app's running server.
    pub async fn request(
        &self,
        app: &CompiledApp,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<AppResponse, CompileError> {
        let Some(record) = self.inner.processes.find_by_id(&app.process_id).await else {
            return Err(CompileError::NotRunning { app_id: app.id.clone() });
        };
        tracing::debug!(app_id = %app.id, pid = record.pid, %method, path, "app request");

        let request_err = |source| CompileError::Request {
            app_id: app.id.clone(),
            source,
        };
        let resp = self
            .inner
            .http
            .client()
            .request(method, format!("http://127.0.0.1:{}{path}", record.port))
            .json(body)
            .send()
            .await
            .map_err(request_err)?;
        let status_code = resp.status().as_u16();
        let body = resp.text().await.map_err(request_err)?;
        Ok(AppResponse { status_code, body })
    }

    /// Calls an exported function of one of the app's `*.server.*` modules,
    /// starting the app's server first when it is down.
    pub async fn run_app_method(
        &self,
        id: &str,
        server_file: &str,
        method_name: &str,
        data: serde_json::Value,
    ) -> Result<AppResponse, CompileError> {
        let (app, _) = self.get_app(id).await?;
        if !self.is_alive(&app).await {
            self.start_app_server(&app).await?;
        }
        self.request(
            &app,
            reqwest::Method::POST,
            "/api/RunAppMethod",
            &serde_json::json!({
                "serverFile": server_file,
                "methodName": method_name,
                "data": data,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::compiler::{AppConfig, tests::{CountingBundler, compiler_with}};

    /// A file-backed app whose daemon is `daemon`.
    async fn daemon_app(dir: &Path, daemon: &[&str]) -> Compiler {
        let app_dir = dir.join("svc");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("index.tsx"), "render(<Svc />)").unwrap();
        let manifest = serde_json::json!({ "id": "svc", "page": "./index.tsx", "daemon": daemon });
        let app = AppConfig::parse(
            Url::from_file_path(app_dir.join("kestrel.app.json")).unwrap(),
            &manifest.to_string(),
        )
        .unwrap();
        compiler_with(dir, vec![app], CountingBundler::new()).await
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn app_files_stay_inside_the_app_dir() {
        let root = Path::new("/srv/apps/todo");
        assert_eq!(
            contained_path(root, "./assets/logo.png"),
            Some(root.join("assets").join("logo.png"))
        );
        assert_eq!(contained_path(root, "package.json"), Some(root.join("package.json")));
        assert_eq!(contained_path(root, "../other/secret"), None);
        assert_eq!(contained_path(root, "/etc/passwd"), None);
        assert_eq!(contained_path(root, "."), None);
    }

    #[test]
    fn runner_is_embedded() {
        assert!(DAEMON_RUNNER.contains("/api/health"));
        assert!(DAEMON_RUNNER.contains("KESTREL_DAEMON_TARGET"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keep_alive_runs_once_and_stops_after_the_server_dies() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = daemon_app(dir.path(), &["sleep", "30"]).await;
        let (app, _) = compiler.get_app("svc").await.unwrap();

        let mut config = ProcessConfig::new(app.process_id.clone(), "sleep");
        config.args = vec!["30".into()];
        config.health_check = Some(HealthCheckSpec::Process);
        compiler.inner.processes.spawn_from_path_var(config).await.unwrap();
        assert!(compiler.is_alive(&app).await);

        assert!(compiler.start_keep_alive(&app));
        assert!(!compiler.start_keep_alive(&app));
        assert!(app.keep_alive_running.load(Ordering::Acquire));

        compiler.inner.processes.kill(&app.process_id).await.unwrap();
        // Three failed checks at the test interval.
        assert!(wait_until(|| !app.keep_alive_running.load(Ordering::Acquire)).await);
        assert!(compiler.start_keep_alive(&app));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unhealthy_server_is_stopped_and_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = daemon_app(dir.path(), &["sleep", "30"]).await;
        let (app, _) = compiler.get_app("svc").await.unwrap();

        let err = compiler.start_server("svc").await.unwrap_err();
        assert!(
            matches!(err, CompileError::ServerStart { reason: "process did not become ready", .. }),
            "{err:?}"
        );
        assert!(compiler.inner.processes.find_by_id(&app.process_id).await.is_none());
        assert!(!app.keep_alive_running.load(Ordering::Acquire));
        assert!(!compiler.app_is_alive("svc").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_replaces_the_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = daemon_app(dir.path(), &["sleep", "30"]).await;
        let (app, _) = compiler.get_app("svc").await.unwrap();

        // Nothing to stop yet.
        compiler.stop_server("svc").await.unwrap();

        let mut config = ProcessConfig::new(app.process_id.clone(), "sleep");
        config.args = vec!["30".into()];
        let first = compiler
            .inner
            .processes
            .spawn_from_path_var(config)
            .await
            .unwrap()
            .record()
            .pid;

        // The replacement never answers its health check, so restart fails
        // after the old process is gone.
        compiler.restart_app("svc").await.unwrap_err();
        let platform = crate::platform::native();
        assert!(wait_until(|| !platform.is_alive(first)).await);
        assert!(compiler.inner.processes.find_by_id(&app.process_id).await.is_none());
    }
}
