//! Try-file fallback resolution.
//!
//! A request path is checked against an ordered list of expressions. The first
//! expression resolving to an existing file (or to a directory holding an index
//! document) replaces the request path. Without a match the path is left alone and
//! the static file service decides between content and not-found.

use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::config::{INDEX_DOCUMENT, URI_VARIABLE};

/// Existence queries against the content root.
#[async_trait]
pub trait FileProbe: Send + Sync {
    /// Whether `path` (relative to the content root, no leading slash) exists.
    async fn exists(&self, path: &str) -> bool;
}

/// Probe backed by a directory on disk. Paths escaping the root never exist.
#[derive(Debug, Clone)]
pub struct RootProbe {
    root: PathBuf,
}

impl RootProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn contained(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

        if escapes {
            None
        } else {
            Some(self.root.join(relative))
        }
    }
}

#[async_trait]
impl FileProbe for RootProbe {
    async fn exists(&self, path: &str) -> bool {
        match self.contained(path) {
            Some(full) => tokio::fs::metadata(full).await.is_ok(),
            None => false,
        }
    }
}

/// Ordered, normalized try-file rules.
#[derive(Debug, Clone, Default)]
pub struct TryFiles {
    rules: Vec<String>,
}

impl TryFiles {
    /// Register rules in order. A rule naming the index document is cut back to its
    /// directory, because the file service answers index requests with a redirect to
    /// the directory, which would re-enter the same rule.
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let index_suffix = format!("/{INDEX_DOCUMENT}");

        let rules = rules
            .into_iter()
            .map(|rule| {
                let rule = rule.as_ref();
                tracing::info!(pattern = %rule, "Registering try file");

                match rule.strip_suffix(INDEX_DOCUMENT) {
                    Some(dir) if rule.ends_with(&index_suffix) => dir.to_string(),
                    _ => rule.to_string(),
                }
            })
            .collect();

        Self { rules }
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the first rule matching for `uri`, returning the rewritten path.
    ///
    /// `uri` is the raw (percent-encoded) request path; the result is in the same form.
    pub async fn resolve(&self, uri: &str, probe: &dyn FileProbe) -> Option<String> {
        for rule in &self.rules {
            let mut path = expand(rule, uri);

            if path.is_empty() {
                path.push('/');
            }

            let relative = decode_path(path.trim_start_matches('/'));

            // a directory only counts when it holds the index document
            let found = if path.ends_with('/') {
                probe.exists(&format!("{relative}{INDEX_DOCUMENT}")).await
            } else {
                probe.exists(&relative).await
            };

            if found {
                tracing::debug!(pattern = %rule, path = %path, "Using try file");
                return Some(path);
            }
        }

        tracing::debug!(path = %uri, "No try files matched");
        None
    }
}

/// Percent-decode a request path for filesystem lookups; undecodable input is used as is.
fn decode_path(path: &str) -> Cow<'_, str> {
    urlencoding::decode(path).unwrap_or(Cow::Borrowed(path))
}

/// Substitute `$name` and `${name}` variables. Only `uri` is known, others expand to nothing.
fn expand(expression: &str, uri: &str) -> String {
    let mut out = String::with_capacity(expression.len() + uri.len());
    let mut rest = expression;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                // unterminated, keep literally
                None => {
                    out.push('$');
                    rest = after;
                    continue;
                }
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
        } else if name == URI_VARIABLE {
            out.push_str(uri);
        } else {
            tracing::warn!(name = %name, "Unknown variable in try file");
        }

        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory probe recording every query.
    struct FakeProbe {
        files: HashSet<&'static str>,
        queries: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new(files: &[&'static str]) -> Self {
            Self {
                files: files.iter().copied().collect(),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FileProbe for FakeProbe {
        async fn exists(&self, path: &str) -> bool {
            self.queries.lock().unwrap().push(path.to_string());
            self.files.contains(path)
        }
    }

    #[test]
    fn test_index_rules_are_normalized() {
        let tries = TryFiles::new(["$uri", "/index.html", "/docs/index.html", "/myindex.html"]);
        assert_eq!(tries.rules(), ["$uri", "/", "/docs/", "/myindex.html"]);
    }

    #[test]
    fn test_expand() {
        assert_eq!(expand("$uri", "/a.js"), "/a.js");
        assert_eq!(expand("${uri}.html", "/page"), "/page.html");
        assert_eq!(expand("/static$uri", "/x"), "/static/x");
        assert_eq!(expand("$other/x", "/a"), "/x");
        assert_eq!(expand("/cost$", "/a"), "/cost$");
        assert_eq!(expand("${uri", "/a"), "${uri");
    }

    #[tokio::test]
    async fn test_falls_through_to_directory_index() {
        let probe = FakeProbe::new(&["index.html"]);
        let tries = TryFiles::new(["$uri", "/index.html"]);

        let resolved = tries.resolve("/missing.js", &probe).await;
        assert_eq!(resolved.as_deref(), Some("/"));
        assert_eq!(probe.queries(), vec!["missing.js", "index.html"]);
    }

    #[tokio::test]
    async fn test_first_match_short_circuits() {
        let probe = FakeProbe::new(&["app.js", "index.html"]);
        let tries = TryFiles::new(["$uri", "/index.html"]);

        let resolved = tries.resolve("/app.js", &probe).await;
        assert_eq!(resolved.as_deref(), Some("/app.js"));
        assert_eq!(probe.queries(), vec!["app.js"]);
    }

    #[tokio::test]
    async fn test_no_match_leaves_path() {
        let probe = FakeProbe::new(&[]);
        let tries = TryFiles::new(["$uri", "/fallback.html"]);
        assert_eq!(tries.resolve("/nothing", &probe).await, None);
    }

    #[tokio::test]
    async fn test_empty_expansion_is_root() {
        let probe = FakeProbe::new(&["index.html"]);
        let tries = TryFiles::new(["$unknown"]);
        assert_eq!(tries.resolve("/x", &probe).await.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn test_root_probe_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "docs").unwrap();

        let probe = RootProbe::new(dir.path());
        assert!(probe.exists("index.html").await);
        assert!(probe.exists("").await);
        assert!(probe.exists("empty/").await);
        assert!(!probe.exists("missing.js").await);
        assert!(!probe.exists("../etc/passwd").await);

        let tries = TryFiles::new(["$uri/", "/index.html"]);
        assert_eq!(tries.resolve("/docs", &probe).await.as_deref(), Some("/docs/"));
        // a directory without index document falls through to the next rule
        assert_eq!(tries.resolve("/empty", &probe).await.as_deref(), Some("/"));
        assert_eq!(tries.resolve("/gone", &probe).await.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn test_directory_without_index_does_not_match() {
        let probe = FakeProbe::new(&["", "index.html"]);
        let tries = TryFiles::new(["/empty/", "/index.html"]);

        assert_eq!(tries.resolve("/x", &probe).await.as_deref(), Some("/"));
        assert_eq!(probe.queries(), vec!["empty/index.html", "index.html"]);
    }

    #[tokio::test]
    async fn test_encoded_path_is_probed_decoded() {
        let probe = FakeProbe::new(&["my file.html"]);
        let tries = TryFiles::new(["$uri", "/index.html"]);

        let resolved = tries.resolve("/my%20file.html", &probe).await;
        assert_eq!(resolved.as_deref(), Some("/my%20file.html"));
        assert_eq!(probe.queries(), vec!["my file.html"]);
    }
}
