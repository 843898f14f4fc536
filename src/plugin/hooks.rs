//! Hook arguments and results exchanged with plugin callbacks.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::build::options::Loader;
use crate::protocol::messages::messages_to_value;
use crate::protocol::{Location, Map, Message, Value};
use crate::stash::{ObjectStash, Stashed};

/// Error type returned by plugin code.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub type HookResult<T> = std::result::Result<T, HookError>;

/// A plugin error that knows where in the source it happened.
///
/// Returning this from a hook fills in the location of the resulting
/// diagnostic; any other error only contributes its display text.
#[derive(Debug, Clone, Error)]
#[error("{text}")]
pub struct PluginDiagnostic {
    pub text: String,
    pub location: Option<Location>,
}

impl PluginDiagnostic {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

/// Turn a hook failure into a diagnostic attributed to `plugin_name`.
///
/// The error object itself becomes the message detail, so callers can
/// downcast it back to [`HookError`] from a final build failure.
pub(crate) fn hook_error_message(error: HookError, plugin_name: &str) -> Message {
    let (text, location) = match error.downcast_ref::<PluginDiagnostic>() {
        Some(diag) => (diag.text.clone(), diag.location.clone()),
        None => (error.to_string(), None),
    };
    let detail: Stashed = std::sync::Arc::new(error);
    let mut message = Message::new(text).with_plugin(plugin_name).with_detail(detail);
    message.location = location;
    message
}

/// Filter selecting which paths an `on_resolve`/`on_load` hook sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookFilter {
    /// Regular expression matched by the worker
    pub filter: String,
    pub namespace: Option<String>,
}

impl HookFilter {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Errors and warnings returned by `on_start` and `on_end` callbacks.
#[derive(Debug, Clone, Default)]
pub struct HookMessages {
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
}

impl HookMessages {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// Fill in the plugin name on messages that do not carry one.
    pub(crate) fn attribute(mut self, plugin_name: &str) -> Self {
        attribute(&mut self.errors, plugin_name);
        attribute(&mut self.warnings, plugin_name);
        self
    }

    pub(crate) fn extend(&mut self, other: HookMessages) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub(crate) fn to_value(&self, stash: &ObjectStash) -> crate::error::Result<Value> {
        Ok(Map::new()
            .with("errors", messages_to_value(&self.errors, stash)?)
            .with("warnings", messages_to_value(&self.warnings, stash)?)
            .into())
    }
}

pub(crate) fn attribute(messages: &mut [Message], plugin_name: &str) {
    for message in messages {
        if message.plugin_name.is_empty() {
            message.plugin_name = plugin_name.to_string();
        }
    }
}

#[derive(Clone, Default)]
pub struct OnResolveArgs {
    pub path: String,
    pub importer: String,
    pub namespace: String,
    pub resolve_dir: String,
    /// e.g. `import-statement`, `require-call`, `entry-point`
    pub kind: String,
    pub plugin_data: Option<Stashed>,
}

impl fmt::Debug for OnResolveArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnResolveArgs")
            .field("path", &self.path)
            .field("importer", &self.importer)
            .field("namespace", &self.namespace)
            .field("resolve_dir", &self.resolve_dir)
            .field("kind", &self.kind)
            .field("plugin_data", &self.plugin_data.is_some())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct OnResolveResult {
    pub path: Option<String>,
    pub namespace: Option<String>,
    pub suffix: Option<String>,
    pub external: Option<bool>,
    pub side_effects: Option<bool>,
    pub plugin_name: Option<String>,
    pub plugin_data: Option<Stashed>,
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
    pub watch_files: Vec<String>,
    pub watch_dirs: Vec<String>,
}

impl OnResolveResult {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn external(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            external: Some(true),
            ..Default::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_plugin_data(mut self, data: Stashed) -> Self {
        self.plugin_data = Some(data);
        self
    }

    pub(crate) fn into_response(mut self, id: u32, plugin_name: &str, stash: &ObjectStash) -> crate::error::Result<Value> {
        let name = self.plugin_name.take().unwrap_or_else(|| plugin_name.to_string());
        attribute(&mut self.errors, &name);
        attribute(&mut self.warnings, &name);

        let mut response = Map::new().with("id", id).with("pluginName", name.as_str());
        if let Some(path) = self.path {
            response.insert("path", path);
        }
        if let Some(namespace) = self.namespace {
            response.insert("namespace", namespace);
        }
        if let Some(suffix) = self.suffix {
            response.insert("suffix", suffix);
        }
        if let Some(external) = self.external {
            response.insert("external", external);
        }
        if let Some(side_effects) = self.side_effects {
            response.insert("sideEffects", side_effects);
        }
        response.insert("pluginData", stash.store(self.plugin_data));
        response.insert("errors", messages_to_value(&self.errors, stash)?);
        response.insert("warnings", messages_to_value(&self.warnings, stash)?);
        response.insert("watchFiles", self.watch_files);
        response.insert("watchDirs", self.watch_dirs);
        Ok(response.into())
    }
}

impl fmt::Debug for OnResolveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnResolveResult")
            .field("path", &self.path)
            .field("namespace", &self.namespace)
            .field("external", &self.external)
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default)]
pub struct OnLoadArgs {
    pub path: String,
    pub namespace: String,
    pub suffix: String,
    pub plugin_data: Option<Stashed>,
}

impl fmt::Debug for OnLoadArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnLoadArgs")
            .field("path", &self.path)
            .field("namespace", &self.namespace)
            .field("suffix", &self.suffix)
            .field("plugin_data", &self.plugin_data.is_some())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct OnLoadResult {
    pub contents: Option<Bytes>,
    pub resolve_dir: Option<String>,
    pub loader: Option<Loader>,
    pub plugin_name: Option<String>,
    pub plugin_data: Option<Stashed>,
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
    pub watch_files: Vec<String>,
    pub watch_dirs: Vec<String>,
}

impl OnLoadResult {
    pub fn contents(contents: impl Into<Bytes>, loader: Loader) -> Self {
        Self {
            contents: Some(contents.into()),
            loader: Some(loader),
            ..Default::default()
        }
    }

    pub(crate) fn into_response(mut self, id: u32, plugin_name: &str, stash: &ObjectStash) -> crate::error::Result<Value> {
        let name = self.plugin_name.take().unwrap_or_else(|| plugin_name.to_string());
        attribute(&mut self.errors, &name);
        attribute(&mut self.warnings, &name);

        let mut response = Map::new().with("id", id).with("pluginName", name.as_str());
        if let Some(contents) = self.contents {
            response.insert("contents", contents);
        }
        if let Some(dir) = self.resolve_dir {
            response.insert("resolveDir", dir);
        }
        if let Some(loader) = self.loader {
            response.insert("loader", loader.as_str());
        }
        response.insert("pluginData", stash.store(self.plugin_data));
        response.insert("errors", messages_to_value(&self.errors, stash)?);
        response.insert("warnings", messages_to_value(&self.warnings, stash)?);
        response.insert("watchFiles", self.watch_files);
        response.insert("watchDirs", self.watch_dirs);
        Ok(response.into())
    }
}

impl fmt::Debug for OnLoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnLoadResult")
            .field("contents", &self.contents.as_ref().map(Bytes::len))
            .field("loader", &self.loader)
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

/// Options for [`Resolver::resolve`](super::Resolver::resolve).
#[derive(Clone, Default)]
pub struct ResolveOptions {
    pub importer: Option<String>,
    pub namespace: Option<String>,
    pub resolve_dir: Option<String>,
    pub kind: Option<String>,
    pub plugin_data: Option<Stashed>,
}

/// What the worker's resolver decided for a path.
#[derive(Debug, Clone, Default)]
pub struct ResolveResult {
    pub errors: Vec<Message>,
    pub warnings: Vec<Message>,
    pub path: String,
    pub external: bool,
    pub side_effects: bool,
    pub namespace: String,
    pub suffix: String,
    pub plugin_data: Option<Stashed>,
}
