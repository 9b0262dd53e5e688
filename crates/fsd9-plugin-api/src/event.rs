//! Events raised by the server and the plugin trait that observes them.

use async_trait::async_trait;
use fsd9_core::Session;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::PluginContext;
use crate::error::PluginResult;
use crate::metadata::PluginDescriptor;

/// Event discriminant, used in descriptors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BeforeStart,
    AfterStart,
    BeforeStop,
    ClientConnected,
    ClientCreated,
    LineReceived,
    LineAudited,
    ClientDisconnected,
}

impl EventKind {
    /// Returns true if the server does something by default for this event
    /// that a plugin can veto.
    pub fn has_default_handling(&self) -> bool {
        matches!(self, EventKind::ClientConnected | EventKind::LineReceived)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::BeforeStart => "before_start",
            EventKind::AfterStart => "after_start",
            EventKind::BeforeStop => "before_stop",
            EventKind::ClientConnected => "client_connected",
            EventKind::ClientCreated => "client_created",
            EventKind::LineReceived => "line_received",
            EventKind::LineAudited => "line_audited",
            EventKind::ClientDisconnected => "client_disconnected",
        };
        f.write_str(name)
    }
}

/// How the server dealt with one inbound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineOutcome {
    /// A plugin prevented built-in handling
    HandledByPlugin,
    /// Built-in handling ran
    Handled { packet_ok: bool, has_result: bool },
}

impl LineOutcome {
    pub fn is_handled_by_plugin(&self) -> bool {
        matches!(self, LineOutcome::HandledByPlugin)
    }
}

/// A server event, borrowing the originating session where there is one.
#[derive(Debug)]
pub enum Event<'a> {
    BeforeStart,
    AfterStart,
    BeforeStop,
    ClientConnected {
        session: &'a mut Session,
    },
    ClientCreated {
        session: &'a mut Session,
    },
    LineReceived {
        session: &'a mut Session,
        line: &'a str,
    },
    LineAudited {
        session: &'a mut Session,
        line: &'a str,
        outcome: &'a LineOutcome,
    },
    ClientDisconnected {
        session: &'a mut Session,
    },
}

impl<'a> Event<'a> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BeforeStart => EventKind::BeforeStart,
            Event::AfterStart => EventKind::AfterStart,
            Event::BeforeStop => EventKind::BeforeStop,
            Event::ClientConnected { .. } => EventKind::ClientConnected,
            Event::ClientCreated { .. } => EventKind::ClientCreated,
            Event::LineReceived { .. } => EventKind::LineReceived,
            Event::LineAudited { .. } => EventKind::LineAudited,
            Event::ClientDisconnected { .. } => EventKind::ClientDisconnected,
        }
    }

    /// The session the event is about, if any.
    pub fn session(&self) -> Option<&Session> {
        match self {
            Event::ClientConnected { session }
            | Event::ClientCreated { session }
            | Event::LineReceived { session, .. }
            | Event::LineAudited { session, .. }
            | Event::ClientDisconnected { session } => Some(&**session),
            Event::BeforeStart | Event::AfterStart | Event::BeforeStop => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            Event::ClientConnected { session }
            | Event::ClientCreated { session }
            | Event::LineReceived { session, .. }
            | Event::LineAudited { session, .. }
            | Event::ClientDisconnected { session } => Some(&mut **session),
            Event::BeforeStart | Event::AfterStart | Event::BeforeStop => None,
        }
    }

    /// The inbound line for line events.
    pub fn line(&self) -> Option<&str> {
        match self {
            Event::LineReceived { line, .. } | Event::LineAudited { line, .. } => Some(*line),
            _ => None,
        }
    }
}

/// What a handler wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOutcome {
    /// Let later plugins and the server see the event
    Continue,
    /// Stop propagation and skip the server's default handling
    Prevent,
}

/// A server extension.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Called for every event kind listed in the descriptor.
    async fn handle(
        &self,
        ctx: &dyn PluginContext,
        event: &mut Event<'_>,
    ) -> PluginResult<EventOutcome>;
}
