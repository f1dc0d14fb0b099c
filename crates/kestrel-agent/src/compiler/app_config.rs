//! App and project configuration, loaded from disk or over HTTPS.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::{
    error::{Classify, ErrorKind},
    http_cache::{CacheClient, FetchError},
};

pub const PROJECT_CONFIG_FILE: &str = "kestrel.json";
pub const APP_CONFIG_FILE: &str = "kestrel.app.json";

#[derive(Debug, thiserror::Error)]
pub enum AppConfigError {
    #[error("app not found: {0}")]
    AppNotFound(String),
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to parse {location}")]
    Parse {
        location: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Classify for AppConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            AppConfigError::AppNotFound(_) => ErrorKind::NotFound,
            AppConfigError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::NotFound
            }
            AppConfigError::Fetch(e) => e.kind(),
            AppConfigError::Parse { .. } | AppConfigError::Invalid(_) => ErrorKind::InvalidInput,
            AppConfigError::Io { .. } => ErrorKind::IoFailure,
        }
    }
}

/// The `daemon` field: either a command line, or a map from
/// `os/arch` to a command line.
fn daemon_command<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Command(Vec<String>),
        PerPlatform(BTreeMap<String, Vec<String>>),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Command(cmd)) => Ok(Some(cmd)),
        Some(Raw::PerPlatform(map)) => {
            let platform = host_platform();
            map.get(&platform).cloned().map(Some).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "daemon map has no entry for the current platform '{platform}'"
                ))
            })
        }
    }
}

/// `os/arch` in the spelling app manifests use (`linux/amd64`, `darwin/arm64`).
pub fn host_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{os}/{arch}")
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub page_icon: String,
    pub page: String,
    /// Copied into the app directory before a remote app's daemon starts.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, deserialize_with = "daemon_command")]
    pub daemon: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub config_url: Url,
    #[serde(flatten)]
    pub manifest: AppManifest,
}

impl AppConfig {
    pub fn parse(config_url: Url, text: &str) -> Result<Self, AppConfigError> {
        let manifest: AppManifest = serde_json::from_str(text).map_err(|source| AppConfigError::Parse {
            location: config_url.to_string(),
            source,
        })?;
        if manifest.id.is_empty() {
            return Err(AppConfigError::Invalid(format!("{config_url} is missing 'id'")));
        }
        if manifest.page.is_empty() {
            return Err(AppConfigError::Invalid(format!("{config_url} is missing 'page'")));
        }
        if manifest.daemon.as_ref().is_some_and(|d| d.is_empty()) {
            return Err(AppConfigError::Invalid(format!("{config_url} has an empty 'daemon'")));
        }
        Ok(Self {
            config_url,
            manifest,
        })
    }

    /// Loads an app config from a `file:` or `http(s):` URL.
    pub async fn load(config_url: Url, http: &CacheClient) -> Result<Self, AppConfigError> {
        let text = read_url(&config_url, http).await?;
        Self::parse(config_url, &text)
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Local edits must always show up, so file-backed apps are never cached.
    pub fn is_file_backed(&self) -> bool {
        self.config_url.scheme() == "file"
    }

    /// Directory holding the config file, for file-backed apps.
    pub fn local_dir(&self) -> Option<PathBuf> {
        if !self.is_file_backed() {
            return None;
        }
        let path = self.config_url.to_file_path().ok()?;
        path.parent().map(Path::to_path_buf)
    }

    /// Resolves `target` against the config's location. Absolute URLs are
    /// returned as they are.
    pub fn resolve(&self, target: &str) -> Result<Url, AppConfigError> {
        if let Ok(url) = Url::parse(target) {
            if url.scheme().len() > 1 {
                return Ok(url);
            }
        }
        self.config_url
            .join(target)
            .map_err(|e| AppConfigError::Invalid(format!("cannot resolve {target}: {e}")))
    }

    pub async fn read_file(&self, http: &CacheClient, target: &str) -> Result<(Url, String), AppConfigError> {
        let url = self.resolve(target)?;
        let text = read_url(&url, http).await?;
        Ok((url, text))
    }
}

async fn read_url(url: &Url, http: &CacheClient) -> Result<String, AppConfigError> {
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| AppConfigError::Invalid(format!("not a local path: {url}")))?;
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| AppConfigError::Io { path, source })
        }
        "http" | "https" => Ok(http.get(url.as_str()).await?.body),
        other => Err(AppConfigError::Invalid(format!("unsupported scheme '{other}' in {url}"))),
    }
}

/// Where app configs come from. Kept behind a trait so the compiler does
/// not care how projects are laid out.
#[async_trait]
pub trait AppConfigLoader: Send + Sync {
    fn project_name(&self) -> &str;

    fn project_path(&self) -> &Path;

    async fn list(&self) -> Result<Vec<AppConfig>, AppConfigError>;

    async fn load(&self, id: &str) -> Result<AppConfig, AppConfigError> {
        self.list()
            .await?
            .into_iter()
            .find(|app| app.id() == id)
            .ok_or_else(|| AppConfigError::AppNotFound(id.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProjectFile {
    name: String,
    #[serde(default)]
    apps: Vec<String>,
}

/// Apps listed in a project's `kestrel.json`.
#[derive(Debug, Clone)]
pub struct ProjectApps {
    name: String,
    path: PathBuf,
    apps: Vec<String>,
    http: CacheClient,
}

impl ProjectApps {
    pub async fn open(project_path: impl AsRef<Path>, http: CacheClient) -> Result<Self, AppConfigError> {
        let path = std::path::absolute(project_path.as_ref()).map_err(|source| AppConfigError::Io {
            path: project_path.as_ref().to_path_buf(),
            source,
        })?;
        let config_path = path.join(PROJECT_CONFIG_FILE);
        let text = tokio::fs::read_to_string(&config_path)
            .await
            .map_err(|source| AppConfigError::Io {
                path: config_path.clone(),
                source,
            })?;
        let file: ProjectFile = serde_json::from_str(&text).map_err(|source| AppConfigError::Parse {
            location: config_path.display().to_string(),
            source,
        })?;
        if file.name.trim().is_empty() {
            return Err(AppConfigError::Invalid(format!(
                "{} is missing the 'name' field",
                config_path.display()
            )));
        }
        Ok(Self {
            name: file.name,
            path,
            apps: file.apps,
            http,
        })
    }

    fn app_url(&self, entry: &str) -> Result<Url, AppConfigError> {
        if let Ok(url) = Url::parse(entry) {
            if url.scheme().len() > 1 {
                return Ok(url);
            }
        }
        let mut path = self.path.join(entry);
        if path.is_dir() {
            path.push(APP_CONFIG_FILE);
        }
        Url::from_file_path(&path)
            .map_err(|_| AppConfigError::Invalid(format!("bad app path {}", path.display())))
    }
}

#[async_trait]
impl AppConfigLoader for ProjectApps {
    fn project_name(&self) -> &str {
        &self.name
    }

    fn project_path(&self) -> &Path {
        &self.path
    }

    async fn list(&self) -> Result<Vec<AppConfig>, AppConfigError> {
        let mut out = Vec::with_capacity(self.apps.len());
        for entry in &self.apps {
            let url = self.app_url(entry)?;
            out.push(AppConfig::load(url, &self.http).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http_cache::HttpCache;

    fn http() -> CacheClient {
        CacheClient::new(Arc::new(HttpCache::new(None, 1024 * 1024)), reqwest::Client::new())
    }

    #[test]
    fn parse_accepts_command_and_platform_map() {
        let url = Url::parse("https://apps.test/todo/kestrel.app.json").unwrap();
        let app = AppConfig::parse(
            url.clone(),
            r#"{"id":"todo","name":"Todo","page":"./index.tsx","daemon":["./server","--flag"]}"#,
        )
        .unwrap();
        assert_eq!(app.manifest.daemon, Some(vec!["./server".into(), "--flag".into()]));
        assert!(!app.is_file_backed());

        let map = format!(r#"{{"id":"x","page":"p.tsx","daemon":{{"{}":["bin"]}}}}"#, host_platform());
        let app = AppConfig::parse(url.clone(), &map).unwrap();
        assert_eq!(app.manifest.daemon, Some(vec!["bin".into()]));

        let other = r#"{"id":"x","page":"p.tsx","daemon":{"plan9/mips":["bin"]}}"#;
        assert!(matches!(AppConfig::parse(url, other), Err(AppConfigError::Parse { .. })));
    }

    #[test]
    fn parse_requires_id_and_page() {
        let url = Url::parse("https://apps.test/a.json").unwrap();
        assert!(matches!(
            AppConfig::parse(url.clone(), r#"{"id":"","page":"x"}"#),
            Err(AppConfigError::Invalid(_))
        ));
        assert!(matches!(
            AppConfig::parse(url, r#"{"id":"a","page":""}"#),
            Err(AppConfigError::Invalid(_))
        ));
    }

    #[test]
    fn resolve_is_relative_to_config() {
        let app = AppConfig::parse(
            Url::parse("https://apps.test/todo/kestrel.app.json").unwrap(),
            r#"{"id":"todo","page":"./src/index.tsx"}"#,
        )
        .unwrap();
        assert_eq!(
            app.resolve("./src/index.tsx").unwrap().as_str(),
            "https://apps.test/todo/src/index.tsx"
        );
        assert_eq!(
            app.resolve("https://cdn.test/x.js").unwrap().as_str(),
            "https://cdn.test/x.js"
        );
    }

    #[tokio::test]
    async fn project_apps_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("apps").join("todo");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join(APP_CONFIG_FILE),
            r#"{"id":"todo","name":"Todo","page":"./index.tsx"}"#,
        )
        .unwrap();
        std::fs::write(app_dir.join("index.tsx"), "export {}").unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            r#"{"name":"demo","apps":["apps/todo"]}"#,
        )
        .unwrap();

        let project = ProjectApps::open(dir.path(), http()).await.unwrap();
        assert_eq!(project.project_name(), "demo");

        let app = project.load("todo").await.unwrap();
        assert!(app.is_file_backed());
        assert_eq!(app.local_dir().unwrap(), app_dir);
        let (_, text) = app.read_file(&http(), &app.manifest.page).await.unwrap();
        assert_eq!(text, "export {}");

        assert!(matches!(
            project.load("missing").await,
            Err(AppConfigError::AppNotFound(_))
        ));
    }

    #[tokio::test]
    async fn project_requires_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_FILE), r#"{"name":"  "}"#).unwrap();
        assert!(matches!(
            ProjectApps::open(dir.path(), http()).await,
            Err(AppConfigError::Invalid(_))
        ));
    }
}
