//! Execution context role detection.
//!
//! Exactly one context per deployment may open the embedded database: the
//! long-lived background worker. Every other context (popup, content
//! scripts) reaches the database through it. A context decides which side
//! it is on from two independent environment signals, and only claims
//! [`Role::Owner`] when both agree.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Which side of the message channel a context is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Holds the storage engine and answers requests.
    Owner,
    /// Forwards every operation to the owner.
    Proxy,
}

impl Role {
    /// Resolve the role from the context's environment signals.
    ///
    /// Owner requires the absence of a windowing surface AND the presence of
    /// the worker-global marker. Any disagreement yields [`Role::Proxy`].
    pub const fn resolve(signals: ContextSignals) -> Self {
        if !signals.window_surface && signals.worker_global {
            Self::Owner
        } else {
            Self::Proxy
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => f.write_str("owner"),
            Self::Proxy => f.write_str("proxy"),
        }
    }
}

/// Environment facts a context observes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextSignals {
    /// The context renders into a window or document.
    pub window_surface: bool,
    /// The context carries the service-worker global marker.
    pub worker_global: bool,
}

/// The kinds of execution context an extension deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// The long-lived background worker.
    #[default]
    Background,
    /// The short-lived popup UI.
    Popup,
    /// A script injected into a visited page.
    ContentScript,
}

impl ContextKind {
    /// The signals a context of this kind observes.
    pub const fn signals(self) -> ContextSignals {
        match self {
            Self::Background => ContextSignals {
                window_surface: false,
                worker_global: true,
            },
            Self::Popup | Self::ContentScript => ContextSignals {
                window_surface: true,
                worker_global: false,
            },
        }
    }

    /// Shorthand for `Role::resolve(self.signals())`.
    pub const fn role(self) -> Role {
        Role::resolve(self.signals())
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Background => f.write_str("background"),
            Self::Popup => f.write_str("popup"),
            Self::ContentScript => f.write_str("content_script"),
        }
    }
}

impl FromStr for ContextKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "background" => Ok(Self::Background),
            "popup" => Ok(Self::Popup),
            "content_script" | "content" => Ok(Self::ContentScript),
            _ => Err(()),
        }
    }
}
