//! Build lifecycle states
//!
//! A build call moves through these states in order. One-shot builds end in
//! `OneShotDone`; contexts stay in `ContextActive` until disposed.

use std::fmt;

/// Stage of one build or context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Options validated and flattened into protocol fields
    Setup,
    /// Plugin setup functions running, one at a time
    PluginInit,
    /// `build` request sent; waiting for the worker
    Sent,
    /// One-shot build finished (successfully or not)
    OneShotDone,
    /// Long-lived context accepting rebuild/watch/serve
    ContextActive,
    /// Context disposed; the build key is retired
    Disposed,
}

impl LifecycleState {
    /// Returns true if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OneShotDone | Self::Disposed)
    }

    /// Whether moving from `self` to `next` is a legal step.
    ///
    /// Any pre-terminal state may jump straight to `OneShotDone`, which is
    /// where the failure funnel lands.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Setup, PluginInit) | (Setup, Sent) | (PluginInit, Sent) => true,
            (Sent, ContextActive) => true,
            (Setup | PluginInit | Sent, OneShotDone) => true,
            (ContextActive, Disposed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::PluginInit => "plugin-init",
            Self::Sent => "sent",
            Self::OneShotDone => "one-shot-done",
            Self::ContextActive => "context-active",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}
