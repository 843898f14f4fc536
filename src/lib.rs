//! Packwire - host-side control layer for an out-of-process bundler
//!
//! The bundler runs as a long-lived worker subprocess. Packwire speaks its
//! length-prefixed binary protocol, multiplexes concurrent builds and plugin
//! callbacks over the one pair of pipes, and drives the build lifecycle
//! (one-shot builds and contexts with rebuild, watch and serve).

pub mod build;
pub mod channel;
pub mod config;
pub mod error;
pub mod plugin;
pub mod protocol;
pub mod stash;

pub use build::{BuildContext, BuildOptions, BuildResult, BuildService, TransformOptions, TransformResult};
pub use channel::{Channel, ChannelConfig, WorkerProcess};
pub use error::{PackwireError, Result};
pub use plugin::{Plugin, PluginBuild, Plugins};
