//! Long-lived build contexts
//!
//! A context keeps its build key registered with the channel until it is
//! disposed, so the worker can rebuild, watch and serve it. Results of
//! rebuilds arrive through the `on-end` request the worker sends after every
//! build of the context.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

use super::result::BuildResult;
use super::state::LifecycleState;
use crate::channel::{Channel, HandleRef, InboundHandler};
use crate::error::{PackwireError, Result};
use crate::plugin::PluginSession;
use crate::protocol::messages::keyed_request;
use crate::protocol::{Commands, Map, Value};
use crate::stash::ObjectStash;

type SharedRebuild = Shared<BoxFuture<'static, Result<BuildResult>>>;

/// The rebuild currently outstanding, if any.
#[derive(Default)]
pub(crate) struct RebuildSlot {
    generation: u64,
    latest: Option<SharedRebuild>,
    /// Settles `latest` with the result of the next `on-end`
    provide: Option<oneshot::Sender<Result<BuildResult>>>,
}

type SlotRef = Arc<Mutex<RebuildSlot>>;

fn lock_slot(slot: &SlotRef) -> MutexGuard<'_, RebuildSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handler for the worker's `on-end` request on a context.
///
/// Runs the plugins' end callbacks, answers with their messages and hands
/// the combined result to a waiting rebuild.
pub(crate) fn on_end_handler(
    slot: &SlotRef,
    session: Option<PluginSession>,
    stash: Arc<ObjectStash>,
) -> InboundHandler {
    let slot = Arc::clone(slot);
    Arc::new(move |request| {
        let slot = Arc::clone(&slot);
        let session = session.clone();
        let stash = Arc::clone(&stash);
        async move {
            let mut result = BuildResult::from_value(&request, &stash)?;
            let hook_messages = match &session {
                Some(session) => session.run_on_end(&result).await,
                None => Default::default(),
            };
            result.errors.extend(hook_messages.errors.iter().cloned());
            result.warnings.extend(hook_messages.warnings.iter().cloned());

            let provide = {
                let mut slot = lock_slot(&slot);
                slot.latest = None;
                slot.provide.take()
            };
            if let Some(provide) = provide {
                let outcome = result.into_outcome("Build").map_err(PackwireError::from);
                let _ = provide.send(outcome);
            }
            hook_messages.to_value(&stash)
        }
        .boxed()
    })
}

/// Options for [`BuildContext::serve`].
#[derive(Clone, Default)]
pub struct ServeOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub servedir: Option<PathBuf>,
    pub on_request: Option<Arc<dyn Fn(ServeRequest) + Send + Sync>>,
}

impl fmt::Debug for ServeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("servedir", &self.servedir)
            .field("on_request", &self.on_request.is_some())
            .finish()
    }
}

/// One request handled by the development server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeRequest {
    pub remote_address: String,
    pub method: String,
    pub path: String,
    pub status: i32,
    pub time_in_ms: i32,
}

impl ServeRequest {
    fn from_args(args: &Value) -> Self {
        let text = |field: &str| args.get(field).and_then(Value::as_str).unwrap_or_default().to_string();
        let int = |field: &str| args.get(field).and_then(Value::as_i32).unwrap_or_default();
        Self {
            remote_address: text("remoteAddress"),
            method: text("method"),
            path: text("path"),
            status: int("status"),
            time_in_ms: int("timeInMS"),
        }
    }
}

/// Where the development server is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeResult {
    pub host: String,
    pub port: u16,
}

struct ContextInner {
    channel: Channel,
    key: u32,
    state: Mutex<LifecycleState>,
    did_dispose: AtomicBool,
    /// The reference held for the context's active lifetime
    handle: Mutex<Option<HandleRef>>,
    rebuild: SlotRef,
    stash: Arc<ObjectStash>,
}

/// A build that stays alive for rebuild, watch and serve until disposed.
#[derive(Clone)]
pub struct BuildContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}

impl BuildContext {
    pub(crate) fn new_slot() -> SlotRef {
        Arc::new(Mutex::new(RebuildSlot::default()))
    }

    pub(crate) fn activate(
        channel: Channel,
        handle: HandleRef,
        rebuild: SlotRef,
        stash: Arc<ObjectStash>,
    ) -> Self {
        tracing::info!(key = handle.key(), "build context active");
        Self {
            inner: Arc::new(ContextInner {
                channel,
                key: handle.key(),
                state: Mutex::new(LifecycleState::ContextActive),
                did_dispose: AtomicBool::new(false),
                handle: Mutex::new(Some(handle)),
                rebuild,
                stash,
            }),
        }
    }

    pub fn key(&self) -> u32 {
        self.inner.key
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.did_dispose.load(Ordering::SeqCst) {
            return Err(PackwireError::Disposed);
        }
        Ok(())
    }

    /// Build again, joining a rebuild that is already outstanding.
    pub async fn rebuild(&self) -> Result<BuildResult> {
        self.ensure_active()?;
        let pending = {
            let mut slot = lock_slot(&self.inner.rebuild);
            match &slot.latest {
                Some(latest) => {
                    tracing::debug!(key = self.inner.key, "joining outstanding rebuild");
                    latest.clone()
                }
                None => {
                    let (provide, settled) = oneshot::channel();
                    slot.generation += 1;
                    slot.provide = Some(provide);
                    let driver = drive_rebuild(
                        self.inner.channel.clone(),
                        self.inner.key,
                        settled,
                        Arc::clone(&self.inner.rebuild),
                        slot.generation,
                        Arc::clone(&self.inner.stash),
                    )
                    .boxed()
                    .shared();
                    slot.latest = Some(driver.clone());
                    driver
                }
            }
        };
        pending.await
    }

    /// Ask the worker to rebuild whenever input files change.
    pub async fn watch(&self) -> Result<()> {
        self.ensure_active()?;
        self.inner
            .channel
            .request(keyed_request(Commands::WATCH, self.inner.key))
            .await?;
        tracing::info!(key = self.inner.key, "watch mode started");
        Ok(())
    }

    /// Start the worker's development server for this context.
    pub async fn serve(&self, options: ServeOptions) -> Result<ServeResult> {
        self.ensure_active()?;
        let mut request = keyed_request(Commands::SERVE, self.inner.key).with("onRequest", options.on_request.is_some());
        if let Some(port) = options.port {
            request.insert("port", u32::from(port));
        }
        if let Some(host) = &options.host {
            request.insert("host", host);
        }
        if let Some(dir) = &options.servedir {
            request.insert("servedir", dir.display().to_string());
        }

        // the worker may report requests before it acknowledges `serve`
        let installed = match options.on_request {
            Some(callback) => {
                let handler: InboundHandler = Arc::new(move |request: Value| {
                    let callback = Arc::clone(&callback);
                    async move {
                        let args = request.get("args").cloned().unwrap_or_default();
                        callback(ServeRequest::from_args(&args));
                        Ok(Value::from(Map::new()))
                    }
                    .boxed()
                });
                self.inner
                    .channel
                    .handles()
                    .add_handler(self.inner.key, Commands::SERVE_REQUEST, handler)
            }
            None => false,
        };

        let served = self.inner.channel.request(request).await.and_then(|response| {
            let port = response
                .get("port")
                .and_then(Value::as_i32)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| PackwireError::Malformed("serve response without a port".to_string()))?;
            let host = response.get("host").and_then(Value::as_str).unwrap_or_default().to_string();
            Ok(ServeResult { host, port })
        });
        if served.is_err() && installed {
            self.inner
                .channel
                .handles()
                .remove_handler(self.inner.key, Commands::SERVE_REQUEST);
        }
        let served = served?;
        tracing::info!(key = self.inner.key, host = %served.host, port = served.port, "serving");
        Ok(served)
    }

    /// Ask the worker to abandon the build in progress. Never fails.
    pub async fn cancel(&self) {
        if self.inner.did_dispose.load(Ordering::SeqCst) {
            return;
        }
        let request = keyed_request(Commands::CANCEL, self.inner.key);
        if let Err(e) = self.inner.channel.request(request).await {
            tracing::debug!(key = self.inner.key, error = %e, "cancel ignored");
        }
    }

    /// Dispose the context. Calling it again is a no-op.
    ///
    /// The build key stays registered until the worker has acknowledged, so
    /// hook requests still in flight for it are answered.
    pub async fn dispose(&self) {
        if self.inner.did_dispose.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = keyed_request(Commands::DISPOSE, self.inner.key);
        if let Err(e) = self.inner.channel.request(request).await {
            tracing::debug!(key = self.inner.key, error = %e, "dispose acknowledged with error");
        }

        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(handle);

        let mut state = self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = LifecycleState::Disposed;
        tracing::info!(key = self.inner.key, "build context disposed");
    }
}

/// Send `rebuild` until an `on-end` has settled the result, at most twice.
///
/// The worker skips the `on-end` notification when it judges a rebuild
/// unnecessary; one extra request covers that case. If the second response
/// is still unsettled its own payload becomes the result.
async fn drive_rebuild(
    channel: Channel,
    key: u32,
    mut settled: oneshot::Receiver<Result<BuildResult>>,
    slot: SlotRef,
    generation: u64,
    stash: Arc<ObjectStash>,
) -> Result<BuildResult> {
    let finish = |slot: &SlotRef| {
        let mut slot = lock_slot(slot);
        if slot.generation == generation {
            slot.latest = None;
            slot.provide = None;
        }
    };

    let mut last_response = Value::Null;
    for attempt in 0..2 {
        tracing::debug!(key, attempt, "sending rebuild");
        match channel.request(keyed_request(Commands::REBUILD, key)).await {
            Ok(response) => last_response = response,
            Err(e) => {
                finish(&slot);
                return Err(e);
            }
        }
        if let Ok(outcome) = settled.try_recv() {
            finish(&slot);
            return outcome;
        }
    }

    finish(&slot);
    tracing::warn!(key, "rebuild finished without an on-end notification");
    BuildResult::from_value(&last_response, &stash)?
        .into_outcome("Build")
        .map_err(PackwireError::from)
}
