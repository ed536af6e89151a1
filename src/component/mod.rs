pub mod worker;

pub use worker::WorkerComponent;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A string from the keymaster named no known lifecycle state or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLifecycleError {
    what: &'static str,
    input: String,
}

impl ParseLifecycleError {
    fn new(what: &'static str, input: &str) -> Self {
        Self {
            what,
            input: input.to_string(),
        }
    }
}

impl fmt::Display for ParseLifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a component {}", self.input, self.what)
    }
}

impl std::error::Error for ParseLifecycleError {}

/// Lifecycle states every component moves through.
///
/// `Created -> Standby -> Ready -> Running -> Ready -> Standby -> ...`
/// with `Exiting` terminal and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
    Created,
    Standby,
    Ready,
    Running,
    Exiting,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Standby => "Standby",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Exiting => "Exiting",
        }
    }
}

impl FromStr for ComponentState {
    type Err = ParseLifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(Self::Created),
            "Standby" => Ok(Self::Standby),
            "Ready" => Ok(Self::Ready),
            "Running" => Ok(Self::Running),
            "Exiting" => Ok(Self::Exiting),
            other => Err(ParseLifecycleError::new("state", other)),
        }
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events a component accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEvent {
    Init,
    DoReady,
    Start,
    Stop,
    DoStandby,
    Exit,
}

impl ComponentEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::DoReady => "do_ready",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::DoStandby => "do_standby",
            Self::Exit => "exit",
        }
    }
}

impl FromStr for ComponentEvent {
    type Err = ParseLifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "do_ready" => Ok(Self::DoReady),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "do_standby" => Ok(Self::DoStandby),
            "exit" => Ok(Self::Exit),
            other => Err(ParseLifecycleError::new("event", other)),
        }
    }
}

impl fmt::Display for ComponentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability record every managed worker implements.
///
/// A component owns its worker thread(s), keeps its own lifecycle FSM
/// and publishes `components.<name>.state` / `.status` in the keymaster
/// on every change. The controller only ever talks to it through this
/// trait.
pub trait BaseComponent: Send {
    /// Unique instance name from the configuration.
    fn name(&self) -> &str;

    /// Declared factory type.
    fn kind(&self) -> &str;

    /// Deliver a lifecycle event. Must not block beyond a bounded
    /// enqueue; the resulting state change is observed through the
    /// keymaster, not through this call.
    fn command(&self, event: ComponentEvent) -> anyhow::Result<()>;

    /// Last locally-known state.
    fn current_state(&self) -> ComponentState;

    /// Whether the worker thread is still alive.
    fn is_healthy(&self) -> bool;

    /// Stop and join the worker. Idempotent.
    fn shutdown(&mut self);
}

/// Constructor registered per component type: `(kind, name,
/// keymaster_url) -> component`. Registered with the controller before
/// `basic_init` and immutable afterwards.
pub type ComponentFactory =
    Arc<dyn Fn(&str, &str, &str) -> anyhow::Result<Box<dyn BaseComponent>> + Send + Sync>;
