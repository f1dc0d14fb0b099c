use std::{fmt, path::PathBuf, str::FromStr};

/// Category reserved for registry bookkeeping topics.
pub const TOPICS_CATEGORY: &str = "/topics";

/// Category prefix under which process log topics live.
pub const LOGS_CATEGORY: &str = "/logs";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is missing the '#' separator: {0:?}")]
    MissingSeparator(String),
    #[error("category must not contain an unescaped '#': {0:?}")]
    HashInCategory(String),
}

/// Structured `(category, key)` name addressing processes, topics and log files.
///
/// The string form is `category#key`. The category never contains a raw `#`,
/// so splitting on the first `#` always recovers both halves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "RawIdentity")]
pub struct Identity {
    category: String,
    key: String,
}

#[derive(serde::Deserialize)]
struct RawIdentity {
    category: String,
    key: String,
}

impl TryFrom<RawIdentity> for Identity {
    type Error = IdentityError;

    fn try_from(raw: RawIdentity) -> Result<Self, Self::Error> {
        Identity::new(raw.category, raw.key)
    }
}

/// Percent-escapes one category segment. `.` is escaped too so that no
/// segment can turn into `.` or `..` once mapped onto a filesystem path.
pub fn escape_segment(part: &str) -> String {
    urlencoding::encode(part).replace('.', "%2E")
}

impl Identity {
    pub fn new(category: impl Into<String>, key: impl Into<String>) -> Result<Self, IdentityError> {
        let category = category.into();
        if category.contains('#') {
            return Err(IdentityError::HashInCategory(category));
        }
        Ok(Self {
            category,
            key: key.into(),
        })
    }

    /// Builds an identity whose category is joined from escaped parts.
    pub fn from_parts<I, S>(parts: I, key: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            category: Self::category(parts),
            key: key.into(),
        }
    }

    /// Joins escaped parts into a `/`-rooted category. Empty parts are skipped.
    pub fn category<I, S>(parts: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .filter(|p| !p.as_ref().is_empty())
            .map(|p| escape_segment(p.as_ref()))
            .collect::<Vec<_>>()
            .join("/");
        format!("/{joined}")
    }

    pub fn category_str(&self) -> &str {
        &self.category
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_empty() || self.key.is_empty()
    }

    /// The topic carrying this process identity's log lines.
    pub fn logs_topic(&self) -> Identity {
        Identity {
            category: format!("{LOGS_CATEGORY}{}", self.category),
            key: self.key.clone(),
        }
    }

    /// Whether this identity lives in the registry's reserved namespace.
    pub fn is_reserved(&self) -> bool {
        self.category == TOPICS_CATEGORY || self.category.starts_with("/topics/")
    }

    /// Relative filesystem path for this identity: one directory per category
    /// segment, then the escaped key plus `extension`.
    pub fn relative_path(&self, extension: &str) -> PathBuf {
        let mut path = PathBuf::new();
        for segment in self.category.split('/').filter(|s| !s.is_empty()) {
            // Categories built with `new` may carry raw dots.
            match segment {
                "." | ".." => path.push(escape_segment(segment)),
                other => path.push(other),
            }
        }
        path.push(format!("{}.{extension}", escape_segment(&self.key)));
        path
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.category, self.key)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, key) = s
            .split_once('#')
            .ok_or_else(|| IdentityError::MissingSeparator(s.to_string()))?;
        Identity::new(category, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_escapes_parts() {
        assert_eq!(Identity::category(["app", "my project", "todo"]), "/app/my%20project/todo");
        assert_eq!(Identity::category(["hello/world"]), "/hello%2Fworld");
        assert_eq!(Identity::category(["..", "a.b"]), "/%2E%2E/a%2Eb");
        assert_eq!(Identity::category(["", "x", ""]), "/x");
    }

    #[test]
    fn category_never_contains_raw_hash() {
        for part in ["#", "a#b", "##", "%23", "#/#"] {
            let category = Identity::category(["app", part]);
            assert!(!category.contains('#'), "{category}");
        }
    }

    #[test]
    fn string_form_round_trips() {
        let ids = [
            Identity::from_parts(["app", "proj"], "server"),
            Identity::from_parts(["weird#cat", "a/b"], "key#with#hashes"),
            Identity::from_parts(Vec::<&str>::new(), ""),
            Identity::new("/plain", "k").unwrap(),
        ];
        for id in ids {
            let parsed: Identity = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert_eq!(
            "no-separator".parse::<Identity>(),
            Err(IdentityError::MissingSeparator("no-separator".into()))
        );
    }

    #[test]
    fn serde_uses_category_and_key() {
        let id = Identity::from_parts(["app", "todo"], "daemon");
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json, serde_json::json!({"category": "/app/todo", "key": "daemon"}));

        let back: Identity = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);

        let bad = serde_json::json!({"category": "/a#b", "key": "k"});
        assert!(serde_json::from_value::<Identity>(bad).is_err());
    }

    #[test]
    fn logs_topic_prefixes_category() {
        let id = Identity::from_parts(["app", "todo"], "daemon");
        let logs = id.logs_topic();
        assert_eq!(logs.to_string(), "/logs/app/todo#daemon");
    }

    #[test]
    fn relative_path_stays_inside_root() {
        let id = Identity::new("/../etc", "../passwd").unwrap();
        let path = id.relative_path("log");
        assert_eq!(path, PathBuf::from("%2E%2E/etc/%2E%2E%2Fpasswd.log"));
    }
}
