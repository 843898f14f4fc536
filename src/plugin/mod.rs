//! Plugin bridge
//!
//! Plugins register hooks during setup; the worker later invokes them by
//! sending `on-start`, `on-resolve`, `on-load` and `on-end` requests for the
//! build key the hooks were registered under.
//!
//! Setup runs one plugin at a time, so every plugin sees the option changes
//! made by the plugins before it.

mod dispatch;
pub mod hooks;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

pub use dispatch::PluginSession;
pub use hooks::{
    HookError, HookFilter, HookMessages, HookResult, OnLoadArgs, OnLoadResult, OnResolveArgs, OnResolveResult,
    PluginDiagnostic, ResolveOptions, ResolveResult,
};

use crate::build::options::BuildOptions;
use crate::build::result::BuildResult;
use crate::channel::Channel;
use crate::error::{PackwireError, Result};
use crate::protocol::messages::{keyed_request, messages_from_field};
use crate::protocol::{Commands, Map, Value};
use crate::stash::ObjectStash;

/// A build plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique within one build
    fn name(&self) -> &str;

    /// Register hooks. May suspend; runs before the build request is sent.
    async fn setup(&self, build: &mut PluginBuild<'_>) -> HookResult<()>;
}

/// The plugins attached to a build, in registration order.
#[derive(Clone, Default)]
pub struct Plugins(Vec<Arc<dyn Plugin>>);

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: impl Plugin + 'static) {
        self.0.push(Arc::new(plugin));
    }

    pub fn with(mut self, plugin: impl Plugin + 'static) -> Self {
        self.push(plugin);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.0.iter()
    }
}

impl fmt::Debug for Plugins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(|p| p.name())).finish()
    }
}

impl From<Vec<Arc<dyn Plugin>>> for Plugins {
    fn from(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self(plugins)
    }
}

pub(crate) type OnStartCallback = Arc<dyn Fn() -> BoxFuture<'static, HookResult<HookMessages>> + Send + Sync>;
pub(crate) type OnEndCallback = Arc<dyn Fn(BuildResult) -> BoxFuture<'static, HookResult<HookMessages>> + Send + Sync>;
pub(crate) type OnResolveCallback =
    Arc<dyn Fn(OnResolveArgs) -> BoxFuture<'static, HookResult<Option<OnResolveResult>>> + Send + Sync>;
pub(crate) type OnLoadCallback =
    Arc<dyn Fn(OnLoadArgs) -> BoxFuture<'static, HookResult<Option<OnLoadResult>>> + Send + Sync>;

#[derive(Debug, Clone)]
struct FilteredHook {
    id: u32,
    filter: HookFilter,
}

impl FilteredHook {
    fn to_value(&self) -> Value {
        Map::new()
            .with("id", self.id)
            .with("filter", self.filter.filter.as_str())
            .with("namespace", self.filter.namespace.clone().unwrap_or_default())
            .into()
    }
}

/// What one plugin registered, as announced to the worker.
#[derive(Debug, Clone, Default)]
struct Registration {
    name: String,
    on_start: bool,
    on_end: bool,
    on_resolve: Vec<FilteredHook>,
    on_load: Vec<FilteredHook>,
}

/// Every hook registered for one build.
#[derive(Default)]
pub(crate) struct HookRegistry {
    next_id: u32,
    registrations: Vec<Registration>,
    pub(crate) on_start: Vec<(String, OnStartCallback)>,
    pub(crate) on_end: Vec<(String, OnEndCallback)>,
    pub(crate) on_resolve: HashMap<u32, (String, OnResolveCallback)>,
    pub(crate) on_load: HashMap<u32, (String, OnLoadCallback)>,
}

impl HookRegistry {
    fn current(&mut self) -> Result<&mut Registration> {
        self.registrations
            .last_mut()
            .ok_or_else(|| PackwireError::Plugin("hook registered outside of plugin setup".to_string()))
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// The `plugins` field of the build request.
    pub(crate) fn to_value(&self) -> Value {
        Value::Array(
            self.registrations
                .iter()
                .map(|r| {
                    Map::new()
                        .with("name", r.name.as_str())
                        .with("onStart", r.on_start)
                        .with("onEnd", r.on_end)
                        .with("onResolve", Value::Array(r.on_resolve.iter().map(FilteredHook::to_value).collect()))
                        .with("onLoad", Value::Array(r.on_load.iter().map(FilteredHook::to_value).collect()))
                        .into()
                })
                .collect(),
        )
    }

    pub(crate) fn has_on_end(&self) -> bool {
        !self.on_end.is_empty()
    }
}

fn check_filter(hook: &str, filter: &HookFilter) -> Result<()> {
    if filter.filter.is_empty() {
        return Err(PackwireError::Plugin(format!("{}() call is missing a filter", hook)));
    }
    regex::Regex::new(&filter.filter)
        .map(|_| ())
        .map_err(|e| PackwireError::Plugin(format!("{}() filter is not a valid regular expression: {}", hook, e)))
}

/// Registration API handed to [`Plugin::setup`].
pub struct PluginBuild<'a> {
    plugin_name: String,
    options: &'a mut BuildOptions,
    registry: &'a mut HookRegistry,
    resolver: Resolver,
}

impl PluginBuild<'_> {
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// The build options, including changes made by earlier plugins.
    pub fn initial_options(&mut self) -> &mut BuildOptions {
        self.options
    }

    /// A resolver usable from hooks once setup has finished.
    pub fn resolver(&self) -> Resolver {
        self.resolver.clone()
    }

    pub fn on_start<F, Fut>(&mut self, callback: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<HookMessages>> + Send + 'static,
    {
        self.registry.current()?.on_start = true;
        let callback: OnStartCallback = Arc::new(move || callback().boxed());
        self.registry.on_start.push((self.plugin_name.clone(), callback));
        Ok(())
    }

    pub fn on_end<F, Fut>(&mut self, callback: F) -> Result<()>
    where
        F: Fn(BuildResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<HookMessages>> + Send + 'static,
    {
        self.registry.current()?.on_end = true;
        let callback: OnEndCallback = Arc::new(move |result| callback(result).boxed());
        self.registry.on_end.push((self.plugin_name.clone(), callback));
        Ok(())
    }

    pub fn on_resolve<F, Fut>(&mut self, filter: HookFilter, callback: F) -> Result<()>
    where
        F: Fn(OnResolveArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<Option<OnResolveResult>>> + Send + 'static,
    {
        check_filter("onResolve", &filter)?;
        let id = self.registry.allocate_id();
        self.registry.current()?.on_resolve.push(FilteredHook { id, filter });
        let callback: OnResolveCallback = Arc::new(move |args| callback(args).boxed());
        self.registry.on_resolve.insert(id, (self.plugin_name.clone(), callback));
        Ok(())
    }

    pub fn on_load<F, Fut>(&mut self, filter: HookFilter, callback: F) -> Result<()>
    where
        F: Fn(OnLoadArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<Option<OnLoadResult>>> + Send + 'static,
    {
        check_filter("onLoad", &filter)?;
        let id = self.registry.allocate_id();
        self.registry.current()?.on_load.push(FilteredHook { id, filter });
        let callback: OnLoadCallback = Arc::new(move |args| callback(args).boxed());
        self.registry.on_load.insert(id, (self.plugin_name.clone(), callback));
        Ok(())
    }
}

/// Asks the worker to resolve a path the way the build would.
#[derive(Clone)]
pub struct Resolver {
    channel: Channel,
    key: u32,
    plugin_name: String,
    setup_done: Arc<AtomicBool>,
    stash: Arc<ObjectStash>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("key", &self.key)
            .field("plugin_name", &self.plugin_name)
            .field("ready", &self.setup_done.load(Ordering::SeqCst))
            .finish()
    }
}

impl Resolver {
    pub async fn resolve(&self, path: &str, options: ResolveOptions) -> Result<ResolveResult> {
        if !self.setup_done.load(Ordering::SeqCst) {
            return Err(PackwireError::Plugin(
                "Cannot call \"resolve\" before plugin setup has completed".to_string(),
            ));
        }

        let mut request = keyed_request(Commands::RESOLVE, self.key)
            .with("pluginName", self.plugin_name.as_str())
            .with("path", path);
        if let Some(importer) = options.importer {
            request.insert("importer", importer);
        }
        if let Some(namespace) = options.namespace {
            request.insert("namespace", namespace);
        }
        if let Some(dir) = options.resolve_dir {
            request.insert("resolveDir", dir);
        }
        if let Some(kind) = options.kind {
            request.insert("kind", kind);
        }
        request.insert("pluginData", self.stash.store(options.plugin_data));

        // hold the build open while the worker answers
        let _hold = self.channel.handles().ref_handle(self.key).then(|| ReleaseOnDrop {
            channel: self.channel.clone(),
            key: self.key,
        });

        let response = self.channel.request(request).await?;
        let text = |field: &str| response.get(field).and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(ResolveResult {
            errors: messages_from_field(&response, "errors", &self.stash)?,
            warnings: messages_from_field(&response, "warnings", &self.stash)?,
            path: text("path"),
            external: response.get("external").and_then(Value::as_bool).unwrap_or(false),
            side_effects: response.get("sideEffects").and_then(Value::as_bool).unwrap_or(true),
            namespace: text("namespace"),
            suffix: text("suffix"),
            plugin_data: response
                .get("pluginData")
                .and_then(Value::as_i32)
                .and_then(|id| self.stash.load(id)),
        })
    }
}

struct ReleaseOnDrop {
    channel: Channel,
    key: u32,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.channel.handles().unref_handle(self.key);
    }
}

/// Run every plugin's setup in order and collect the registered hooks.
///
/// `options` is the record the plugins may mutate; the returned session
/// answers the worker's hook requests for `key`.
pub(crate) async fn run_setup(
    plugins: &Plugins,
    options: &mut BuildOptions,
    channel: &Channel,
    key: u32,
    stash: Arc<ObjectStash>,
) -> Result<PluginSession> {
    let setup_done = Arc::new(AtomicBool::new(false));
    let mut registry = HookRegistry::default();

    for (index, plugin) in plugins.iter().enumerate() {
        let name = plugin.name().to_string();
        if name.is_empty() {
            return Err(PackwireError::Plugin(format!("Plugin at index {} is missing a name", index)));
        }
        if registry.registrations.iter().any(|r| r.name == name) {
            return Err(PackwireError::Plugin(format!("Duplicate plugin name \"{}\"", name)));
        }
        registry.registrations.push(Registration {
            name: name.clone(),
            ..Default::default()
        });

        let resolver = Resolver {
            channel: channel.clone(),
            key,
            plugin_name: name.clone(),
            setup_done: Arc::clone(&setup_done),
            stash: Arc::clone(&stash),
        };
        let mut build = PluginBuild {
            plugin_name: name.clone(),
            options: &mut *options,
            registry: &mut registry,
            resolver,
        };

        tracing::debug!(plugin = %name, index, "running plugin setup");
        if let Err(error) = plugin.setup(&mut build).await {
            return Err(PackwireError::BuildFailed(crate::build::result::BuildFailure::new(
                "Build",
                vec![hooks::hook_error_message(error, &name)],
                Vec::new(),
            )));
        }
    }

    setup_done.store(true, Ordering::SeqCst);
    Ok(PluginSession::new(registry, stash))
}
