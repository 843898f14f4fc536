//! Protocol commands and diagnostic records.
//!
//! Requests are maps with a `command` field; build-scoped requests also
//! carry the build `key`. Diagnostics travel as plain maps whose `detail`
//! field is an object stash handle.

use serde::{Deserialize, Serialize};

use super::value::{Map, Value};
use crate::error::{PackwireError, Result};
use crate::stash::{ObjectStash, Stashed};

/// Known command names as constants.
pub struct Commands;

impl Commands {
    // Keep-alive
    pub const PING: &'static str = "ping";

    // Host → worker
    pub const BUILD: &'static str = "build";
    pub const REBUILD: &'static str = "rebuild";
    pub const WATCH: &'static str = "watch";
    pub const SERVE: &'static str = "serve";
    pub const CANCEL: &'static str = "cancel";
    pub const DISPOSE: &'static str = "dispose";
    pub const TRANSFORM: &'static str = "transform";
    pub const FORMAT_MSGS: &'static str = "format-msgs";
    pub const ANALYZE_METAFILE: &'static str = "analyze-metafile";
    pub const RESOLVE: &'static str = "resolve";
    pub const ERROR: &'static str = "error";

    // Worker → host
    pub const ON_START: &'static str = "on-start";
    pub const ON_RESOLVE: &'static str = "on-resolve";
    pub const ON_LOAD: &'static str = "on-load";
    pub const ON_END: &'static str = "on-end";
    pub const SERVE_REQUEST: &'static str = "serve-request";
}

/// Start a request map for `command`.
pub fn request(command: &str) -> Map {
    Map::new().with("command", command)
}

/// Start a build-scoped request map for `command`.
pub fn keyed_request(command: &str, key: u32) -> Map {
    request(command).with("key", key)
}

/// The `error` string of a response, if it carries one.
pub fn response_error(value: &Value) -> Option<&str> {
    value.get("error").and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Source location attached to a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Location {
    pub file: String,
    pub namespace: String,
    /// 1-based
    pub line: i32,
    /// 0-based, in bytes
    pub column: i32,
    /// in bytes
    pub length: i32,
    pub line_text: String,
    pub suggestion: String,
}

/// Secondary text attached to a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Note {
    pub text: String,
    pub location: Option<Location>,
}

/// An error or warning reported by the worker or by a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub id: String,
    pub plugin_name: String,
    pub text: String,
    pub location: Option<Location>,
    pub notes: Vec<Note>,
    /// Arbitrary value exchanged through the object stash.
    #[serde(skip)]
    pub detail: Option<Stashed>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, name: impl Into<String>) -> Self {
        self.plugin_name = name.into();
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_detail(mut self, detail: Stashed) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Encode for the wire, stashing `detail`.
    pub fn to_value(&self, stash: &ObjectStash) -> Result<Value> {
        let mut value = Value::from_serialize(self)?;
        if let Value::Map(map) = &mut value {
            map.insert("detail", stash.store(self.detail.clone()));
        }
        Ok(value)
    }

    /// Decode from the wire, resolving `detail` through the stash.
    pub fn from_value(value: &Value, stash: &ObjectStash) -> Result<Self> {
        let mut message: Message = value.deserialize_into()?;
        message.detail = value.get("detail").and_then(Value::as_i32).and_then(|id| stash.load(id));
        Ok(message)
    }
}

/// Encode a message list.
pub fn messages_to_value(messages: &[Message], stash: &ObjectStash) -> Result<Value> {
    Ok(Value::Array(
        messages.iter().map(|m| m.to_value(stash)).collect::<Result<_>>()?,
    ))
}

/// Decode the message list under `field`; a missing field is an empty list.
pub fn messages_from_field(value: &Value, field: &str, stash: &ObjectStash) -> Result<Vec<Message>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(|m| Message::from_value(m, stash)).collect(),
        Some(other) => Err(PackwireError::Malformed(format!(
            "expected an array of messages in \"{}\", got {:?}",
            field, other
        ))),
    }
}

/// Response sent back for an inbound request whose handler failed.
pub fn error_response(text: impl Into<String>) -> Value {
    let message = Map::new()
        .with("id", "")
        .with("pluginName", "")
        .with("text", text.into())
        .with("location", Value::Null)
        .with("notes", Value::Array(Vec::new()))
        .with("detail", crate::stash::NO_VALUE);
    Map::new().with("errors", vec![Value::Map(message)]).into()
}

/// Which kind of diagnostic `format-msgs` should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
}
