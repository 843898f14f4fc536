//! Dispatch of worker hook requests to registered callbacks.
//!
//! `on-resolve` and `on-load` carry the ids of the hooks whose filters
//! matched; those are tried in order and the first one returning a result
//! claims the request. `on-start` and `on-end` callbacks all run
//! concurrently and their messages are merged.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;

use super::hooks::{HookMessages, HookResult, OnLoadArgs, OnResolveArgs, hook_error_message};
use super::{HookRegistry, OnLoadCallback, OnResolveCallback};
use crate::build::result::BuildResult;
use crate::channel::{HandlerTable, InboundHandler};
use crate::error::Result;
use crate::protocol::messages::messages_to_value;
use crate::protocol::{Commands, Map, Value};
use crate::stash::{ObjectStash, Stashed};

struct SessionInner {
    hooks: HookRegistry,
    stash: Arc<ObjectStash>,
}

/// Hooks registered for one build, ready to answer the worker.
#[derive(Clone)]
pub struct PluginSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = &self.inner.hooks;
        f.debug_struct("PluginSession")
            .field("on_start", &hooks.on_start.len())
            .field("on_end", &hooks.on_end.len())
            .field("on_resolve", &hooks.on_resolve.len())
            .field("on_load", &hooks.on_load.len())
            .finish()
    }
}

fn text_field(value: &Value, field: &str) -> String {
    value.get(field).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn hook_ids(value: &Value) -> Vec<u32> {
    value
        .get("ids")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_u32).collect())
        .unwrap_or_default()
}

/// Run one global callback, turning a failure or panic into an error entry.
async fn run_global<F>(name: &str, callback: F) -> HookMessages
where
    F: std::future::Future<Output = HookResult<HookMessages>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(messages)) => messages.attribute(name),
        Ok(Err(error)) => HookMessages {
            errors: vec![hook_error_message(error, name)],
            warnings: Vec::new(),
        },
        Err(_) => HookMessages {
            errors: vec![hook_error_message(format!("{} callback panicked", name).into(), name)],
            warnings: Vec::new(),
        },
    }
}

impl PluginSession {
    pub(crate) fn new(hooks: HookRegistry, stash: Arc<ObjectStash>) -> Self {
        Self {
            inner: Arc::new(SessionInner { hooks, stash }),
        }
    }

    /// The `plugins` field of the build request.
    pub fn registrations(&self) -> Value {
        self.inner.hooks.to_value()
    }

    pub fn has_on_end(&self) -> bool {
        self.inner.hooks.has_on_end()
    }

    pub fn stash(&self) -> &Arc<ObjectStash> {
        &self.inner.stash
    }

    /// Inbound handlers for `on-start`, `on-resolve` and `on-load`.
    pub(crate) fn handlers(&self) -> HandlerTable {
        let mut table = HandlerTable::new();

        let session = self.clone();
        let on_start: InboundHandler = Arc::new(move |_| {
            let session = session.clone();
            async move {
                session.inner.stash.clear();
                let messages = session.run_on_start().await;
                messages.to_value(&session.inner.stash)
            }
            .boxed()
        });
        table.insert(Commands::ON_START.to_string(), on_start);

        let session = self.clone();
        let on_resolve: InboundHandler = Arc::new(move |request| {
            let session = session.clone();
            async move { session.on_resolve(request).await }.boxed()
        });
        table.insert(Commands::ON_RESOLVE.to_string(), on_resolve);

        let session = self.clone();
        let on_load: InboundHandler = Arc::new(move |request| {
            let session = session.clone();
            async move { session.on_load(request).await }.boxed()
        });
        table.insert(Commands::ON_LOAD.to_string(), on_load);

        table
    }

    /// Run all `on_start` callbacks concurrently.
    pub async fn run_on_start(&self) -> HookMessages {
        let runs = self
            .inner
            .hooks
            .on_start
            .iter()
            .map(|(name, callback)| run_global(name, callback()));
        let mut merged = HookMessages::default();
        for messages in join_all(runs).await {
            merged.extend(messages);
        }
        merged
    }

    /// Run all `on_end` callbacks concurrently against `result`.
    pub async fn run_on_end(&self, result: &BuildResult) -> HookMessages {
        let runs = self
            .inner
            .hooks
            .on_end
            .iter()
            .map(|(name, callback)| run_global(name, callback(result.clone())));
        let mut merged = HookMessages::default();
        for messages in join_all(runs).await {
            merged.extend(messages);
        }
        merged
    }

    fn plugin_data(&self, request: &Value) -> Option<Stashed> {
        request
            .get("pluginData")
            .and_then(Value::as_i32)
            .and_then(|id| self.inner.stash.load(id))
    }

    fn failure_response(&self, id: u32, name: &str, error: super::HookError) -> Result<Value> {
        let message = hook_error_message(error, name);
        Ok(Map::new()
            .with("id", id)
            .with("pluginName", name)
            .with("errors", messages_to_value(&[message], &self.inner.stash)?)
            .into())
    }

    async fn on_resolve(&self, request: Value) -> Result<Value> {
        let args = OnResolveArgs {
            path: text_field(&request, "path"),
            importer: text_field(&request, "importer"),
            namespace: text_field(&request, "namespace"),
            resolve_dir: text_field(&request, "resolveDir"),
            kind: text_field(&request, "kind"),
            plugin_data: self.plugin_data(&request),
        };

        for id in hook_ids(&request) {
            let Some((name, callback)) = self.inner.hooks.on_resolve.get(&id) else {
                tracing::warn!(id, "on-resolve for an unknown hook id");
                continue;
            };
            let callback: &OnResolveCallback = callback;
            match callback(args.clone()).await {
                Ok(Some(result)) => return result.into_response(id, name, &self.inner.stash),
                Ok(None) => continue,
                Err(error) => return self.failure_response(id, name, error),
            }
        }
        Ok(Map::new().into())
    }

    async fn on_load(&self, request: Value) -> Result<Value> {
        let args = OnLoadArgs {
            path: text_field(&request, "path"),
            namespace: text_field(&request, "namespace"),
            suffix: text_field(&request, "suffix"),
            plugin_data: self.plugin_data(&request),
        };

        for id in hook_ids(&request) {
            let Some((name, callback)) = self.inner.hooks.on_load.get(&id) else {
                tracing::warn!(id, "on-load for an unknown hook id");
                continue;
            };
            let callback: &OnLoadCallback = callback;
            match callback(args.clone()).await {
                Ok(Some(result)) => return result.into_response(id, name, &self.inner.stash),
                Ok(None) => continue,
                Err(error) => return self.failure_response(id, name, error),
            }
        }
        Ok(Map::new().into())
    }
}
