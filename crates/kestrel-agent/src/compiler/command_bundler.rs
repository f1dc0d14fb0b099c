//! [`Bundler`] backed by an external `esbuild` executable.
//!
//! The entry source goes in on stdin and the bundle comes back on stdout.
//! Remote entries are mirrored into a scratch directory first, following
//! their relative imports, so the executable only ever sees local files.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{io::AsyncWriteExt, process::Command};
use url::Url;

use super::bundler::{BuildFailure, BuildMessage, BuildOutput, BuildRequest, Bundler, Location, Platform};
use crate::http_cache::CacheClient;

const MAX_MIRRORED_MODULES: usize = 512;

/// Compiles a constant pattern once.
fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("constant regex pattern"))
}

const SERVER_FILE_PATTERN: &str = r"\.server\.[cm]?[jt]sx?$";
const EXPORT_PATTERN: &str =
    r"(?m)^\s*export\s+(?:async\s+)?(?:function\*?\s*|const\s+|let\s+|var\s+|class\s+)([A-Za-z_$][\w$]*)";
const IMPORT_PATTERN: &str = r#"(?:\bfrom\s*|\bimport\s*\(?\s*)["']([^"']+)["']"#;
const LOCATION_PATTERN: &str = r"^\s+(\S.*?):(\d+):(\d+):\s*$";
const PLUGIN_SUFFIX_PATTERN: &str = r"\s*\[plugin ([^\]]+)\]$";

fn server_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, SERVER_FILE_PATTERN)
}

fn export_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, EXPORT_PATTERN)
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, IMPORT_PATTERN)
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, LOCATION_PATTERN)
}

fn plugin_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, PLUGIN_SUFFIX_PATTERN)
}

pub fn is_server_file(path: &str) -> bool {
    server_file_re().is_match(path)
}

/// Names exported by a module, in source order, without duplicates.
pub fn exported_names(source: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    export_re()
        .captures_iter(source)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Relative import specifiers (`./x`, `../y`) in a module.
fn relative_imports(source: &str) -> Vec<String> {
    import_re()
        .captures_iter(source)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|spec| spec.starts_with("./") || spec.starts_with("../"))
        .map(str::to_string)
        .collect()
}

/// Parses the bundler's stderr into structured messages.
pub fn parse_diagnostics(stderr: &str) -> Vec<BuildMessage> {
    let mut messages = Vec::new();
    let mut lines = stderr.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((_, rest)) = line.split_once("[ERROR]") else {
            continue;
        };
        let mut text = rest.trim().to_string();
        let mut plugin_name = None;
        if let Some(caps) = plugin_suffix_re().captures(&text) {
            plugin_name = caps.get(1).map(|m| m.as_str().to_string());
            let start = caps.get(0).map_or(text.len(), |m| m.start());
            text.truncate(start);
        }

        while lines.peek().is_some_and(|l| l.trim().is_empty()) {
            lines.next();
        }
        let location = lines
            .peek()
            .and_then(|l| location_re().captures(l))
            .and_then(|caps| {
                Some(Location {
                    file: caps.get(1)?.as_str().to_string(),
                    line: caps.get(2)?.as_str().parse().ok()?,
                    column: caps.get(3)?.as_str().parse().ok()?,
                })
            });
        if location.is_some() {
            lines.next();
        }

        messages.push(BuildMessage {
            text,
            plugin_name,
            location,
        });
    }
    messages
}

/// Local path a remote module is mirrored to: `<root>/<host>/<path>`.
fn mirror_path(root: &Path, url: &Url) -> Option<PathBuf> {
    let mut out = root.join(url.host_str()?);
    for segment in url.path_segments()? {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => out.push(s),
        }
    }
    Some(out)
}

#[derive(Debug, Clone)]
pub struct CommandBundler {
    program: String,
    scratch_dir: PathBuf,
}

impl CommandBundler {
    pub fn new(program: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Downloads a remote entry and every module it reaches through relative
    /// imports. Returns the local directory the entry resolves against.
    async fn mirror(&self, request: &BuildRequest, entry_url: &Url) -> Result<PathBuf, BuildFailure> {
        let root = self.scratch_dir.join(&request.app_id);
        let entry_path = mirror_path(&root, entry_url)
            .ok_or_else(|| BuildFailure::single(format!("cannot mirror {entry_url}")))?;

        let mut queue = VecDeque::new();
        let mut seen = BTreeSet::new();
        for spec in relative_imports(&request.entry.contents) {
            queue.push_back((entry_url.clone(), spec));
        }

        while let Some((importer, spec)) = queue.pop_front() {
            if seen.len() >= MAX_MIRRORED_MODULES {
                return Err(BuildFailure::single(format!(
                    "too many remote modules reachable from {entry_url}"
                )));
            }
            let url = importer
                .join(&spec)
                .map_err(|e| BuildFailure::single(format!("bad import {spec} in {importer}: {e}")))?;
            if !seen.insert(url.to_string()) {
                continue;
            }
            let body = fetch(&request.fetcher, &url, &importer).await?;
            for next in relative_imports(&body) {
                queue.push_back((url.clone(), next));
            }
            let path = mirror_path(&root, &url)
                .ok_or_else(|| BuildFailure::single(format!("cannot mirror {url}")))?;
            write(&path, &body).await?;
        }

        entry_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BuildFailure::single(format!("cannot mirror {entry_url}")))
    }

    async fn server_exports(cwd: &Path, metafile: &serde_json::Value) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        let Some(inputs) = metafile.get("inputs").and_then(|v| v.as_object()) else {
            return out;
        };
        for input in inputs.keys().filter(|k| is_server_file(k)) {
            let path = cwd.join(input);
            match tokio::fs::read_to_string(&path).await {
                Ok(source) => {
                    let abs = std::path::absolute(&path).unwrap_or(path);
                    out.insert(abs.display().to_string(), exported_names(&source));
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to read server module"),
            }
        }
        out
    }
}

async fn fetch(client: &CacheClient, url: &Url, importer: &Url) -> Result<String, BuildFailure> {
    match url.scheme() {
        "http" | "https" => client
            .get(url.as_str())
            .await
            .map(|r| r.body)
            .map_err(|e| BuildFailure {
                messages: vec![BuildMessage {
                    text: format!("failed to fetch {url}: {e}"),
                    plugin_name: Some("http".to_string()),
                    location: Some(Location {
                        file: importer.to_string(),
                        line: 0,
                        column: 0,
                    }),
                }],
            }),
        other => Err(BuildFailure::single(format!("unsupported import scheme '{other}' for {url}"))),
    }
}

async fn write(path: &Path, contents: &str) -> Result<(), BuildFailure> {
    let fail = |e: std::io::Error| BuildFailure::single(format!("failed to write {}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }
    tokio::fs::write(path, contents).await.map_err(fail)
}

#[async_trait]
impl Bundler for CommandBundler {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BuildFailure> {
        let cwd = match (&request.entry.resolve_dir, Url::parse(&request.entry.source_file)) {
            (Some(dir), _) => dir.clone(),
            (None, Ok(url)) if matches!(url.scheme(), "http" | "https") => self.mirror(&request, &url).await?,
            (None, _) => self.scratch_dir.join(&request.app_id),
        };
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| BuildFailure::single(format!("failed to create {}: {e}", cwd.display())))?;

        let meta_dir = self.scratch_dir.join(&request.app_id);
        tokio::fs::create_dir_all(&meta_dir)
            .await
            .map_err(|e| BuildFailure::single(format!("failed to create {}: {e}", meta_dir.display())))?;
        let metafile_path = meta_dir.join(match request.platform {
            Platform::Browser => "client.meta.json",
            Platform::Node => "server.meta.json",
        });

        let (platform, format) = match request.platform {
            Platform::Browser => ("browser", "esm"),
            Platform::Node => ("node", "cjs"),
        };
        let source_name = Url::parse(&request.entry.source_file)
            .ok()
            .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| request.entry.source_file.clone());

        let mut cmd = Command::new(&self.program);
        cmd.arg("--bundle")
            .arg(format!("--format={format}"))
            .arg(format!("--platform={platform}"))
            .arg("--target=esnext")
            .arg(format!("--loader={}", request.entry.loader.as_str()))
            .arg(format!("--sourcefile={source_name}"))
            .arg(format!("--metafile={}", metafile_path.display()))
            .arg("--log-level=error")
            .arg("--color=false")
            .args(request.defines.iter().map(|(k, v)| format!("--define:{k}={v}")))
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BuildFailure::single(format!("failed to run {}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.entry.contents.as_bytes())
                .await
                .map_err(|e| BuildFailure::single(format!("failed to write bundler input: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BuildFailure::single(format!("bundler did not finish: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let messages = parse_diagnostics(&stderr);
            if messages.is_empty() {
                let detail = stderr.trim();
                return Err(BuildFailure::single(if detail.is_empty() {
                    format!("{} exited with {}", self.program, output.status)
                } else {
                    detail.to_string()
                }));
            }
            return Err(BuildFailure { messages });
        }

        let metafile = match tokio::fs::read_to_string(&metafile_path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        let server_exports = match request.platform {
            Platform::Browser => Self::server_exports(&cwd, &metafile).await,
            Platform::Node => BTreeMap::new(),
        };

        Ok(BuildOutput {
            code: String::from_utf8_lossy(&output.stdout).into_owned(),
            metafile,
            server_exports,
        })
    }
}
