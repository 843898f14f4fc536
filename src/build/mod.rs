//! Build service - the public entry point for builds and transforms
//!
//! A build call walks the lifecycle in [`state::LifecycleState`]: options are
//! validated and flattened, plugin setup runs one plugin at a time, the
//! `build` request is sent under a fresh build key, and the response either
//! finishes a one-shot build or activates a [`BuildContext`].

pub mod context;
pub mod options;
pub mod result;
pub mod state;

use std::sync::Arc;

use bytes::Bytes;

pub use context::{BuildContext, ServeOptions, ServeRequest, ServeResult};
pub use options::{BuildOptions, EntryPoint, Format, Loader, LogLevel, Platform, Sourcemap, TransformOptions};
pub use result::{BuildFailure, BuildResult, OutputFile, TransformResult};
pub use state::LifecycleState;

use crate::channel::{Channel, HandlerTable};
use crate::error::{PackwireError, Result};
use crate::plugin::{self, PluginSession};
use crate::protocol::messages::{messages_from_field, messages_to_value, request};
use crate::protocol::{Commands, Message, MessageKind, Value};
use crate::stash::ObjectStash;

/// Options for [`BuildService::format_messages`].
#[derive(Debug, Clone, Copy)]
pub struct FormatMessagesOptions {
    pub kind: MessageKind,
    pub color: bool,
    pub terminal_width: Option<u32>,
}

impl Default for FormatMessagesOptions {
    fn default() -> Self {
        Self {
            kind: MessageKind::Error,
            color: false,
            terminal_width: None,
        }
    }
}

/// Options for [`BuildService::analyze_metafile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeMetafileOptions {
    pub color: bool,
    pub verbose: bool,
}

/// Tracks one build call through its lifecycle.
struct Lifecycle {
    key: u32,
    state: LifecycleState,
}

impl Lifecycle {
    fn new(key: u32) -> Self {
        Self {
            key,
            state: LifecycleState::Setup,
        }
    }

    fn advance(&mut self, next: LifecycleState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(key = self.key, from = %self.state, to = %next, "unexpected lifecycle transition");
        }
        tracing::debug!(key = self.key, from = %self.state, to = %next, "lifecycle");
        self.state = next;
    }
}

/// Builds, contexts and transforms over one worker channel.
#[derive(Debug, Clone)]
pub struct BuildService {
    channel: Channel,
}

impl BuildService {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Run a one-shot build.
    pub async fn build(&self, options: BuildOptions) -> Result<BuildResult> {
        let key = self.channel.handles().allocate_key();
        let mut lifecycle = Lifecycle::new(key);
        let stash = Arc::new(ObjectStash::new());
        let flags = options.to_flags();

        let outcome = self.run_build(options, &mut lifecycle, Arc::clone(&stash), false).await;
        let (response, handle, session) = match outcome {
            Ok(sent) => sent,
            Err(error) => {
                lifecycle.advance(LifecycleState::OneShotDone);
                return Err(self.fail(flags, error, "Build", &stash).await);
            }
        };

        let mut result = match BuildResult::from_value(&response, &stash) {
            Ok(result) => result,
            Err(error) => {
                drop(handle);
                lifecycle.advance(LifecycleState::OneShotDone);
                return Err(self.fail(flags, error, "Build", &stash).await);
            }
        };
        if let Some(session) = session.filter(PluginSession::has_on_end) {
            let hook_messages = session.run_on_end(&result).await;
            result.errors.extend(hook_messages.errors);
            result.warnings.extend(hook_messages.warnings);
        }
        // the temporary reference taken for the request
        drop(handle);
        lifecycle.advance(LifecycleState::OneShotDone);

        tracing::info!(
            key,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "build finished"
        );
        result.into_outcome("Build").map_err(PackwireError::from)
    }

    /// Create a long-lived build context.
    pub async fn context(&self, options: BuildOptions) -> Result<BuildContext> {
        let key = self.channel.handles().allocate_key();
        let mut lifecycle = Lifecycle::new(key);
        let stash = Arc::new(ObjectStash::new());
        let flags = options.to_flags();
        let slot = BuildContext::new_slot();

        let outcome = self
            .run_build_with(options, &mut lifecycle, Arc::clone(&stash), true, |table, session, stash| {
                table.insert(
                    Commands::ON_END.to_string(),
                    context::on_end_handler(&slot, session, stash),
                );
            })
            .await;
        let (response, handle, _session) = match outcome {
            Ok(sent) => sent,
            Err(error) => {
                lifecycle.advance(LifecycleState::OneShotDone);
                return Err(self.fail(flags, error, "Context", &stash).await);
            }
        };

        let decoded = messages_from_field(&response, "errors", &stash)
            .and_then(|errors| Ok((errors, messages_from_field(&response, "warnings", &stash)?)));
        let (errors, warnings) = match decoded {
            Ok(decoded) => decoded,
            Err(error) => {
                drop(handle);
                lifecycle.advance(LifecycleState::OneShotDone);
                return Err(self.fail(flags, error, "Context", &stash).await);
            }
        };
        if !errors.is_empty() {
            lifecycle.advance(LifecycleState::OneShotDone);
            return Err(BuildFailure::new("Context", errors, warnings).into());
        }

        // trade the temporary reference for the context's own
        let active = handle
            .try_clone()
            .ok_or_else(|| PackwireError::Protocol(format!("build key {} retired before activation", key)))?;
        drop(handle);
        lifecycle.advance(LifecycleState::ContextActive);
        Ok(BuildContext::activate(self.channel.clone(), active, slot, stash))
    }

    async fn run_build(
        &self,
        options: BuildOptions,
        lifecycle: &mut Lifecycle,
        stash: Arc<ObjectStash>,
        context: bool,
    ) -> Result<(Value, crate::channel::HandleRef, Option<PluginSession>)> {
        self.run_build_with(options, lifecycle, stash, context, |_, _, _| {}).await
    }

    /// Setup, plugin init and send. Returns the response together with the
    /// temporary handle reference held while it was outstanding.
    async fn run_build_with<F>(
        &self,
        mut options: BuildOptions,
        lifecycle: &mut Lifecycle,
        stash: Arc<ObjectStash>,
        context: bool,
        extra_handlers: F,
    ) -> Result<(Value, crate::channel::HandleRef, Option<PluginSession>)>
    where
        F: FnOnce(&mut HandlerTable, Option<PluginSession>, Arc<ObjectStash>),
    {
        let key = lifecycle.key;
        options.validate()?;

        let plugins = std::mem::take(&mut options.plugins);
        let session = if plugins.is_empty() {
            None
        } else {
            lifecycle.advance(LifecycleState::PluginInit);
            Some(plugin::run_setup(&plugins, &mut options, &self.channel, key, Arc::clone(&stash)).await?)
        };

        let mut request = options.to_request(key, context)?;
        let mut table = HandlerTable::new();
        if let Some(session) = &session {
            request.insert("plugins", session.registrations());
            table.extend(session.handlers());
        }
        extra_handlers(&mut table, session.clone(), Arc::clone(&stash));

        let handle = self.channel.handles().register(key, table);
        lifecycle.advance(LifecycleState::Sent);
        tracing::info!(key, context, plugins = plugins.len(), "sending build");
        let response = self.channel.request(request).await?;
        Ok((response, handle, session))
    }

    /// Failure funnel: tell the worker, then reject with every error.
    async fn fail(&self, flags: Vec<String>, error: PackwireError, operation: &'static str, stash: &ObjectStash) -> PackwireError {
        if error.is_fatal() {
            return error;
        }
        let failure = match error {
            PackwireError::BuildFailed(failure) => failure,
            other => BuildFailure::new(operation, vec![Message::new(other.to_string())], Vec::new()),
        };

        if let Some(first) = failure.errors.first()
            && let Ok(message) = first.to_value(stash)
        {
            let notice = request(Commands::ERROR).with("flags", flags).with("error", message);
            match self.channel.send_request(notice) {
                Ok(pending) => {
                    let _ = pending.await;
                }
                Err(e) => tracing::debug!(error = %e, "could not report build failure to worker"),
            }
        }
        tracing::warn!(errors = failure.errors.len(), "{} failed", operation);
        failure.into()
    }

    /// Transform one file's worth of source text.
    pub async fn transform(&self, input: impl Into<Bytes>, options: TransformOptions) -> Result<TransformResult> {
        let stash = ObjectStash::new();
        let request = options.to_request(input.into())?;
        let response = self.channel.request(request).await?;
        TransformResult::from_value(&response, &stash)
    }

    /// Render diagnostics the way the worker prints them.
    pub async fn format_messages(&self, messages: &[Message], options: FormatMessagesOptions) -> Result<Vec<String>> {
        let stash = ObjectStash::new();
        let mut req = request(Commands::FORMAT_MSGS)
            .with("messages", messages_to_value(messages, &stash)?)
            .with("isWarning", options.kind == MessageKind::Warning)
            .with("color", options.color);
        if let Some(width) = options.terminal_width {
            req.insert("terminalWidth", width);
        }
        let response = self.channel.request(req).await?;
        Ok(response
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    /// Summarize a metafile as a size report.
    pub async fn analyze_metafile(&self, metafile: &str, options: AnalyzeMetafileOptions) -> Result<String> {
        let req = request(Commands::ANALYZE_METAFILE)
            .with("metafile", metafile)
            .with("color", options.color)
            .with("verbose", options.verbose);
        let response = self.channel.request(req).await?;
        response
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PackwireError::Malformed("analyze-metafile response without a result".to_string()))
    }
}
