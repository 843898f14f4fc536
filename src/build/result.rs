//! Build and transform results
//!
//! Results are decoded by hand from protocol values so that output file
//! contents stay as the `Bytes` the codec produced.

use std::path::PathBuf;
use std::sync::OnceLock;

use bytes::Bytes;
use thiserror::Error;

use super::options::{MangleCache, MangleValue};
use crate::error::{PackwireError, Result};
use crate::protocol::messages::messages_from_field;
use crate::protocol::{Message, Value};
use crate::stash::ObjectStash;

/// Number of errors listed in a failure's display text.
const FAILURE_DISPLAY_LIMIT: usize = 5;

/// A build or transform that finished with errors.
#[derive(Debug, Clone, Error)]
#[error("{}", describe_failure(.operation, .errors))]
pub struct BuildFailure {
    /// `"Build"`, `"Transform"`, `"Context"`, ...
    pub operation: &'static str,
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
}

impl BuildFailure {
    pub fn new(operation: &'static str, errors: Vec<Message>, warnings: Vec<Message>) -> Self {
        Self {
            operation,
            errors,
            warnings,
        }
    }
}

fn describe_failure(operation: &str, errors: &[Message]) -> String {
    let mut text = format!("{} failed", operation);
    if errors.is_empty() {
        return text;
    }
    text.push_str(&format!(
        " with {} error{}:",
        errors.len(),
        if errors.len() == 1 { "" } else { "s" }
    ));
    for error in errors.iter().take(FAILURE_DISPLAY_LIMIT) {
        let plugin = if error.plugin_name.is_empty() {
            String::new()
        } else {
            format!("[plugin: {}] ", error.plugin_name)
        };
        match &error.location {
            Some(loc) => text.push_str(&format!(
                "\n{}:{}:{}: ERROR: {}{}",
                loc.file, loc.line, loc.column, plugin, error.text
            )),
            None => text.push_str(&format!("\nerror: {}{}", plugin, error.text)),
        }
    }
    if errors.len() > FAILURE_DISPLAY_LIMIT {
        text.push_str("\n...");
    }
    text
}

/// A file produced by a build with `write: false`.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: PathBuf,
    pub hash: String,
    contents: Bytes,
    text: OnceLock<String>,
}

impl OutputFile {
    pub fn new(path: impl Into<PathBuf>, contents: Bytes, hash: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            hash: hash.into(),
            contents,
            text: OnceLock::new(),
        }
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    /// Replace the contents and drop the cached text view.
    pub fn set_contents(&mut self, contents: Bytes) {
        self.contents = contents;
        self.text = OnceLock::new();
    }

    /// Contents decoded as UTF-8, computed on first use.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.contents).into_owned())
    }

    fn from_value(value: &Value) -> Result<Self> {
        let path = value
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| PackwireError::Malformed("output file without a path".to_string()))?;
        let contents = value.get("contents").and_then(Value::to_bytes).unwrap_or_default();
        let hash = value.get("hash").and_then(Value::as_str).unwrap_or_default();
        Ok(Self::new(path, contents, hash))
    }
}

/// Outcome of a build or rebuild.
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
    /// Only present for builds with `write: false`
    pub output_files: Option<Vec<OutputFile>>,
    /// JSON text, present when `metafile` was requested
    pub metafile: Option<String>,
    pub mangle_cache: Option<MangleCache>,
}

impl BuildResult {
    /// Decode a `build` response or `on-end` payload.
    pub fn from_value(value: &Value, stash: &ObjectStash) -> Result<Self> {
        let output_files = match value.get("outputFiles") {
            None | Some(Value::Null) => None,
            Some(Value::Array(files)) => Some(files.iter().map(OutputFile::from_value).collect::<Result<_>>()?),
            Some(other) => {
                return Err(PackwireError::Malformed(format!(
                    "expected an array in \"outputFiles\", got {:?}",
                    other
                )));
            }
        };
        Ok(Self {
            errors: messages_from_field(value, "errors", stash)?,
            warnings: messages_from_field(value, "warnings", stash)?,
            output_files,
            metafile: value.get("metafile").and_then(Value::as_str).map(str::to_string),
            mangle_cache: mangle_cache_from_value(value.get("mangleCache")),
        })
    }

    pub fn is_failure(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Turn a result with errors into a [`BuildFailure`].
    pub fn into_outcome(self, operation: &'static str) -> std::result::Result<Self, BuildFailure> {
        if self.is_failure() {
            Err(BuildFailure::new(operation, self.errors, self.warnings))
        } else {
            Ok(self)
        }
    }
}

fn mangle_cache_from_value(value: Option<&Value>) -> Option<MangleCache> {
    let map = value?.as_map()?;
    Some(
        map.iter()
            .filter_map(|(k, v)| MangleValue::from_value(v).map(|v| (k.to_string(), v)))
            .collect(),
    )
}

/// Outcome of a transform call.
#[derive(Debug, Clone, Default)]
pub struct TransformResult {
    pub code: String,
    pub map: String,
    pub warnings: Vec<Message>,
    pub legal_comments: Option<String>,
    pub mangle_cache: Option<MangleCache>,
}

impl TransformResult {
    pub(crate) fn from_value(value: &Value, stash: &ObjectStash) -> Result<Self> {
        let errors = messages_from_field(value, "errors", stash)?;
        let warnings = messages_from_field(value, "warnings", stash)?;
        if !errors.is_empty() {
            return Err(BuildFailure::new("Transform", errors, warnings).into());
        }
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::to_bytes)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        };
        Ok(Self {
            code: text("code").unwrap_or_default(),
            map: text("map").unwrap_or_default(),
            warnings,
            legal_comments: text("legalComments"),
            mangle_cache: mangle_cache_from_value(value.get("mangleCache")),
        })
    }
}
