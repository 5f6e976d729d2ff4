//! Additional response headers.
//!
//! Headers come from `--header "Name: value"` parameters and from header files.
//! They are kept in declaration order behind the mandatory `Server` identity header.
//! When applied to a response every entry overwrites earlier ones of the same name,
//! so the last declaration wins.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use http::header::{HeaderMap, HeaderName, HeaderValue, SERVER};

use crate::config::SERVER_IDENTITY;

/// Ordered list of response headers.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    entries: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderSet {
    /// Compose the header set: identity header, then CLI parameters, then files.
    pub fn compose<P: AsRef<Path>>(params: &[String], files: &[P]) -> Result<Self, HeaderError> {
        let mut lines: Vec<String> = params.to_vec();

        for file in files {
            let file = file.as_ref();
            tracing::info!(file = %file.display(), "Reading additional header file");
            lines.extend(read_header_file(file)?);
        }

        let mut set = Self::default();
        set.push(SERVER.as_str(), SERVER_IDENTITY)?;

        for line in &lines {
            tracing::info!(header = %line, "Adding header");
            let (name, value) = split_header_line(line);
            set.push(name, &value)?;
        }

        Ok(set)
    }

    fn push(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HeaderError::InvalidName(name.to_string()))?;

        // Continuation lines are joined with '\n', which cannot go on the wire.
        let wire_value = value.replace(['\r', '\n'], " ");
        let header_value = HeaderValue::from_str(&wire_value).map_err(|_| {
            HeaderError::InvalidValue {
                name: name.to_string(),
                value: value.to_string(),
            }
        })?;

        self.entries.push((header_name, header_value));
        Ok(())
    }

    /// Apply all headers to a response header map, later entries replacing earlier ones.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.entries {
            headers.insert(name.clone(), value.clone());
        }
    }

    pub fn entries(&self) -> &[(HeaderName, HeaderValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split a curl-style header line at the first colon. A line without colon yields an empty value.
fn split_header_line(line: &str) -> (&str, String) {
    match line.split_once(':') {
        Some((name, value)) => (name, value.trim().to_string()),
        None => (line, String::new()),
    }
}

fn read_header_file(path: &Path) -> Result<Vec<String>, HeaderError> {
    let file = std::fs::File::open(path).map_err(|source| HeaderError::File {
        path: path.to_path_buf(),
        source,
    })?;

    parse_header_lines(std::io::BufReader::new(file)).map_err(|source| HeaderError::File {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse header lines from a reader.
///
/// Blank lines and lines starting with `#` are skipped. A line starting with a space
/// continues the previous header; its trimmed content is appended after a newline.
pub fn parse_header_lines<R: BufRead>(reader: R) -> std::io::Result<Vec<String>> {
    let mut lines: Vec<String> = Vec::new();

    for line in reader.lines() {
        let line = line?;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push('\n');
                last.push_str(line.trim());
                continue;
            }
        }

        lines.push(line.trim().to_string());
    }

    Ok(lines)
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("could not process header file {path:?}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid header name {0:?}")]
    InvalidName(String),
    #[error("invalid value {value:?} for header {name:?}")]
    InvalidValue { name: String, value: String },
}
