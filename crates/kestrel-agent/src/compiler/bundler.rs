//! The contract with the external bundling engine.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use url::Url;

use crate::http_cache::CacheClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Browser,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Loader {
    Js,
    Tsx,
}

impl Loader {
    pub fn as_str(self) -> &'static str {
        match self {
            Loader::Js => "js",
            Loader::Tsx => "tsx",
        }
    }
}

/// Source handed to the bundler in place of an entry file.
#[derive(Debug, Clone)]
pub struct EntrySource {
    pub contents: String,
    /// Name used in diagnostics and the metafile.
    pub source_file: String,
    /// Directory relative imports resolve against, for file-backed sources.
    pub resolve_dir: Option<PathBuf>,
    pub loader: Loader,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub app_id: String,
    pub entry: EntrySource,
    pub platform: Platform,
    /// Compile-time constants, e.g. `process.env.KESTREL_APP_ID`.
    pub defines: BTreeMap<String, String>,
    /// Where the app's config lives; remote imports resolve against it.
    pub base_url: Url,
    /// Shared fetch client for resolving remote modules.
    pub fetcher: CacheClient,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutput {
    pub code: String,
    /// Dependency graph reported by the bundler.
    pub metafile: serde_json::Value,
    /// Absolute paths of `*.server.*` modules mapped to their exported names.
    pub server_exports: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMessage {
    pub text: String,
    pub plugin_name: Option<String>,
    pub location: Option<Location>,
}

impl fmt::Display for BuildMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(plugin) = &self.plugin_name {
            write!(f, "{plugin}: ")?;
        }
        write!(f, "{}", self.text)?;
        if let Some(loc) = &self.location {
            // Namespaced files look like `http:https://host/x.ts`.
            let file = match loc.file.split_once(':') {
                Some((ns, rest)) if !ns.contains('/') && !ns.contains('\\') && ns.len() > 1 => rest,
                _ => loc.file.as_str(),
            };
            write!(f, " in {file}:{}:{}", loc.line, loc.column)?;
        }
        Ok(())
    }
}

/// Errors reported by the bundler for one build.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BuildFailure {
    pub messages: Vec<BuildMessage>,
}

impl BuildFailure {
    pub fn single(text: impl Into<String>) -> Self {
        Self {
            messages: vec![BuildMessage {
                text: text.into(),
                plugin_name: None,
                location: None,
            }],
        }
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.messages.is_empty() {
            return write!(f, "Unknown error");
        }
        writeln!(f, "Build failed with {} errors:", self.messages.len())?;
        for message in &self.messages {
            write!(f, "\n - {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {}

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BuildFailure>;
}

/// Source of the daemon entrypoint: imports every server module and
/// re-exports its functions as `serverRpcMethods[path][name]`.
pub fn server_entrypoint(exports: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for (n, path) in exports.keys().enumerate() {
        out.push_str(&format!("import * as server{n} from {};\n", js_string(path)));
    }
    out.push_str("\nexport const serverRpcMethods = {\n");
    for (n, (path, names)) in exports.iter().enumerate() {
        out.push_str(&format!("\t{}: {{\n", js_string(path)));
        for name in names {
            out.push_str(&format!("\t\t{name}: server{n}.{name},\n"));
        }
        out.push_str("\t},\n");
    }
    out.push_str("};\n");
    out
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("'{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_lists_every_message() {
        let failure = BuildFailure {
            messages: vec![
                BuildMessage {
                    text: "Could not resolve \"left-pad\"".into(),
                    plugin_name: Some("http-loader".into()),
                    location: Some(Location {
                        file: "http:https://example.test/app.tsx".into(),
                        line: 3,
                        column: 7,
                    }),
                },
                BuildMessage {
                    text: "Unexpected end of file".into(),
                    plugin_name: None,
                    location: Some(Location {
                        file: "src/index.tsx".into(),
                        line: 10,
                        column: 0,
                    }),
                },
            ],
        };
        assert_eq!(
            failure.to_string(),
            "Build failed with 2 errors:\n\n - http-loader: Could not resolve \"left-pad\" in https://example.test/app.tsx:3:7\n - Unexpected end of file in src/index.tsx:10:0"
        );
    }

    #[test]
    fn empty_failure_is_unknown() {
        assert_eq!(BuildFailure { messages: vec![] }.to_string(), "Unknown error");
    }

    #[test]
    fn entrypoint_reexports_server_functions() {
        let exports = BTreeMap::from([
            ("/app/a.server.ts".to_string(), vec!["getTodos".to_string(), "addTodo".to_string()]),
            ("/app/b.server.ts".to_string(), vec!["ping".to_string()]),
        ]);
        let src = server_entrypoint(&exports);
        assert!(src.contains("import * as server0 from \"/app/a.server.ts\";"));
        assert!(src.contains("import * as server1 from \"/app/b.server.ts\";"));
        assert!(src.contains("\t\"/app/a.server.ts\": {\n\t\tgetTodos: server0.getTodos,\n\t\taddTodo: server0.addTodo,\n\t},"));
        assert!(src.contains("\t\tping: server1.ping,"));
        assert!(src.ends_with("};\n"));
    }
}
