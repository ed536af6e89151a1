use crate::component::{BaseComponent, ComponentEvent, ComponentFactory};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::fsm::{Fsm, Transition};
use crate::io::SemFifo;
use crate::keymaster::{Keymaster, KeymasterServer};
use crate::utils::StateCell;
use crate::utils::config_io::load_tree;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// States of the global lifecycle FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Created,
    Standby,
    Ready,
    Running,
    Exiting,
}

impl ControllerState {
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

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the global FSM.
///
/// `StateReport` is the internal self-event the service thread fires
/// after every registry update so guards re-evaluate; the built-in
/// transitions ignore it, user transitions may hook it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Init,
    GetReady,
    Start,
    Stop,
    DoStandby,
    Exit,
    StateReport,
    Custom(String),
}

impl ControllerEvent {
    pub fn parse(s: &str) -> Self {
        match s {
            "init" => Self::Init,
            "get_ready" => Self::GetReady,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "do_standby" => Self::DoStandby,
            "exit" => Self::Exit,
            "state_report" => Self::StateReport,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::GetReady => f.write_str("get_ready"),
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::DoStandby => f.write_str("do_standby"),
            Self::Exit => f.write_str("exit"),
            Self::StateReport => f.write_str("state_report"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// One component as seen by an FSM guard.
#[derive(Debug, Clone)]
pub struct ComponentSnapshot {
    pub name: String,
    pub state: String,
    pub status: String,
    pub active: bool,
}

/// Immutable view of the component registry handed to FSM guards, so
/// guards stay pure and never touch the registry mutex.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub components: Vec<ComponentSnapshot>,
}

impl StateSnapshot {
    /// Quorum predicate: every active component is in `state`.
    pub fn all_active_in(&self, state: &str) -> bool {
        self.components
            .iter()
            .filter(|c| c.active)
            .all(|c| c.state == state)
    }

    /// Active components not yet in `state`.
    pub fn pending(&self, state: &str) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| c.active && c.state != state)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Cheap read-only status snapshot, published on every change.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub mode: String,
    pub degraded: bool,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            state: ControllerState::Created,
            mode: String::new(),
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReportKind {
    State,
    Status,
}

/// What a subscription callback hands to the service thread.
struct StateReport {
    component: String,
    kind: ReportKind,
    value: Value,
}

struct ComponentEntry {
    instance: Box<dyn BaseComponent>,
    state: String,
    status: String,
    active: bool,
}

/// Registry of managed components plus the condvar quorum waiters park
/// on. `done` flips once at termination so waiters can bail out.
struct Registry {
    map: Mutex<BTreeMap<String, ComponentEntry>>,
    changed: Condvar,
    done: AtomicBool,
}

impl Registry {
    fn snapshot(&self) -> StateSnapshot {
        let map = self.map.lock().unwrap();
        StateSnapshot {
            components: map
                .iter()
                .map(|(name, e)| ComponentSnapshot {
                    name: name.clone(),
                    state: e.state.clone(),
                    status: e.status.clone(),
                    active: e.active,
                })
                .collect(),
        }
    }
}

enum ConfigSource {
    File(String),
    Tree(Value),
}

type ControllerFsm = Fsm<ControllerState, ControllerEvent, StateSnapshot>;

struct Core {
    cfg: ControllerConfig,
    // Field kept for ownership: dropping it closes the mem:// url.
    _km_server: KeymasterServer,
    keymaster: Keymaster,
    keymaster_url: String,
    registry: Arc<Registry>,
    mode_sets: BTreeMap<String, BTreeSet<String>>,
    fsm: Arc<Mutex<ControllerFsm>>,
    status: Arc<StateCell<ControllerStatus>>,
    report_fifo: SemFifo<StateReport>,
    dropped_reports: Arc<AtomicU64>,
    service: Mutex<Option<JoinHandle<()>>>,
    op_lock: Mutex<()>,
    terminated: AtomicBool,
}

impl Core {
    fn set_status(&self, update: impl FnOnce(&mut ControllerStatus)) {
        let mut next = (*self.status.load()).clone();
        update(&mut next);
        self.status.publish(next);
    }
}

/// Top-level orchestrator of a set of components.
///
/// The controller creates the keymaster from the configuration
/// document, instantiates every declared component through the
/// registered factories, subscribes to their state keys and drives them
/// together through the shared lifecycle:
///
/// ```ignore
/// let mut controller = Controller::new("conf/instrument.yaml");
/// controller.add_component_factory("camera", WorkerComponent::factory());
/// controller.basic_init()?;
/// controller.initialize()?;
/// controller.set_system_mode("capture")?;
/// controller.ready()?;
/// controller.start()?;
/// // ...
/// controller.terminate();
/// ```
///
/// Lifecycle calls are serialised; each fires the global FSM, fans the
/// event out to every active component and blocks until the quorum
/// reaches the expected state or the configured timeout fires. A quorum
/// timeout does not roll the FSM back: the system stays in the reached
/// state and `controller.status` reports `degraded`.
pub struct Controller {
    source: ConfigSource,
    factories: BTreeMap<String, ComponentFactory>,
    extra_transitions: Vec<Transition<ControllerState, ControllerEvent, StateSnapshot>>,
    core: Option<Core>,
}

impl Controller {
    /// Controller over a configuration document on disk.
    pub fn new(config_file: impl Into<String>) -> Self {
        Self {
            source: ConfigSource::File(config_file.into()),
            factories: BTreeMap::new(),
            extra_transitions: Vec::new(),
            core: None,
        }
    }

    /// Controller over an already-built configuration tree.
    pub fn from_value(tree: Value) -> Self {
        Self {
            source: ConfigSource::Tree(tree),
            factories: BTreeMap::new(),
            extra_transitions: Vec::new(),
            core: None,
        }
    }

    /// Register the factory for a component type. A duplicate type
    /// overwrites and returns the previous factory.
    pub fn add_component_factory(
        &mut self,
        kind: impl Into<String>,
        factory: ComponentFactory,
    ) -> Option<ComponentFactory> {
        self.factories.insert(kind.into(), factory)
    }

    /// Register a user-defined transition on the global FSM. Before
    /// `basic_init` the transition is queued and installed after the
    /// built-in ones.
    pub fn add_transition(
        &mut self,
        transition: Transition<ControllerState, ControllerEvent, StateSnapshot>,
    ) {
        match self.core.as_ref() {
            Some(core) => core.fsm.lock().unwrap().add_transition(transition),
            None => self.extra_transitions.push(transition),
        }
    }

    /// One-shot initialization: create the keymaster, build the global
    /// FSM, instantiate every component, subscribe to their state keys
    /// and start the service thread. Returns once every component has
    /// reported `Created`.
    pub fn basic_init(&mut self) -> ControllerResult<()> {
        if self.core.is_some() {
            return Err(ControllerError::InvalidState {
                event: "basic_init".into(),
                state: self.status().state.as_str().into(),
            });
        }

        let tree: Value = match &self.source {
            ConfigSource::File(path) => load_tree(path)
                .map_err(|e| ControllerError::ConfigurationMalformed(format!("{e:#}")))?,
            ConfigSource::Tree(tree) => tree.clone(),
        };

        let cfg: ControllerConfig = match tree.get("controller") {
            Some(section) => serde_json::from_value(section.clone()).map_err(|e| {
                ControllerError::ConfigurationMalformed(format!("controller section: {e}"))
            })?,
            None => ControllerConfig::default(),
        };

        // Validate the components section and collect (name, type)
        // before constructing anything, so an unknown type leaves no
        // partial components behind.
        let declared = declared_components(&tree)?;
        for (name, kind) in &declared {
            if !self.factories.contains_key(kind) {
                tracing::error!(
                    "[Controller] component '{}' declares unknown type '{}'",
                    name,
                    kind
                );
                return Err(ControllerError::UnknownComponentType(kind.clone()));
            }
        }

        let mode_sets = derive_mode_sets(&tree, &declared)?;

        let km_server = KeymasterServer::with_tree(tree)
            .map_err(|e| ControllerError::Resource(format!("{e:#}")))?;
        let keymaster_url = km_server.url().to_string();
        let keymaster = Keymaster::connect(&keymaster_url)?;

        let status = StateCell::new_arc(ControllerStatus::default());
        let fsm = Arc::new(Mutex::new(build_fsm(
            keymaster.clone(),
            status.clone(),
            std::mem::take(&mut self.extra_transitions),
        )));

        // Build every instance; tear down the ones already built if a
        // factory fails.
        let mut map: BTreeMap<String, ComponentEntry> = BTreeMap::new();
        for (name, kind) in &declared {
            let factory = &self.factories[kind];
            match factory(kind, name, &keymaster_url) {
                Ok(instance) => {
                    map.insert(
                        name.clone(),
                        ComponentEntry {
                            instance,
                            state: String::new(),
                            status: String::new(),
                            active: true,
                        },
                    );
                }
                Err(err) => {
                    tracing::error!(
                        "[Controller] factory for '{}' (type {}) failed: {:#}",
                        name,
                        kind,
                        err
                    );
                    for entry in map.values_mut() {
                        entry.instance.shutdown();
                    }
                    return Err(ControllerError::ConfigurationMalformed(format!(
                        "failed to build component '{name}': {err:#}"
                    )));
                }
            }
        }

        let registry = Arc::new(Registry {
            map: Mutex::new(map),
            changed: Condvar::new(),
            done: AtomicBool::new(false),
        });

        let report_fifo: SemFifo<StateReport> =
            SemFifo::new(cfg.state_fifo_capacity.unwrap_or(100));
        let dropped_reports = Arc::new(AtomicU64::new(0));

        // Subscribe to every component's state and status keys. The
        // callback runs on the keymaster dispatch thread and must do
        // nothing beyond a bounded try_put.
        for (name, _) in &declared {
            for (kind, path) in [
                (ReportKind::State, format!("components.{name}.state")),
                (ReportKind::Status, format!("components.{name}.status")),
            ] {
                let fifo = report_fifo.clone();
                let dropped = dropped_reports.clone();
                let component = name.clone();
                keymaster.subscribe(&path, move |_, node| {
                    let report = StateReport {
                        component: component.clone(),
                        kind,
                        value: node.clone(),
                    };
                    if fifo.try_put(report).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        crate::warn_throttled!(
                            Duration::from_secs(1),
                            "[Controller] state-report queue full, dropping report"
                        );
                    }
                })?;
            }
        }

        // Components published their initial state before we
        // subscribed; prime the registry with a read so the race is
        // closed in both directions.
        {
            let mut map = registry.map.lock().unwrap();
            for (name, entry) in map.iter_mut() {
                if let Ok(node) = keymaster.get(&format!("components.{name}.state")) {
                    if let Some(s) = node.as_str() {
                        entry.state = s.to_string();
                    }
                }
                if let Ok(node) = keymaster.get(&format!("components.{name}.status")) {
                    if let Some(s) = node.as_str() {
                        entry.status = s.to_string();
                    }
                }
            }
        }

        let service = thread::Builder::new()
            .name("controller-state".into())
            .spawn({
                let fifo = report_fifo.clone();
                let registry = registry.clone();
                let fsm = fsm.clone();
                move || service_loop(fifo, registry, fsm)
            })
            .map_err(|e| ControllerError::Resource(format!("service thread: {e}")))?;

        let init_timeout = Duration::from_millis(cfg.init_timeout_ms.unwrap_or(5_000));
        let count = declared.len();
        let registry_handle = registry.clone();
        let keymaster_handle = keymaster.clone();

        self.core = Some(Core {
            cfg,
            _km_server: km_server,
            keymaster,
            keymaster_url: keymaster_url.clone(),
            registry,
            mode_sets,
            fsm,
            status,
            report_fifo,
            dropped_reports,
            service: Mutex::new(Some(service)),
            op_lock: Mutex::new(()),
            terminated: AtomicBool::new(false),
        });

        if !self.wait_all_in_state("Created", Some(init_timeout)) {
            return Err(ControllerError::QuorumTimeout {
                expected: "Created".into(),
                pending: registry_handle.snapshot().pending("Created"),
            });
        }

        keymaster_handle.put("controller.state", Value::String("Created".into()))?;
        keymaster_handle.put("controller.mode", Value::String(String::new()))?;
        keymaster_handle.put("controller.status", Value::String("ok".into()))?;

        tracing::info!(
            "[Controller] initialized {} components at {}",
            count,
            keymaster_url
        );
        Ok(())
    }

    /// Select the topology mode. Only legal while the global FSM is in
    /// `Standby`; recomputes every component's `active` flag from the
    /// mode's connections.
    pub fn set_system_mode(&self, mode: &str) -> ControllerResult<()> {
        let core = self.core("set_system_mode")?;
        let _op = core.op_lock.lock().unwrap();

        {
            let fsm = core.fsm.lock().unwrap();
            if *fsm.state() != ControllerState::Standby {
                return Err(ControllerError::InvalidState {
                    event: "set_system_mode".into(),
                    state: fsm.state().as_str().into(),
                });
            }
        }

        let Some(active) = core.mode_sets.get(mode) else {
            return Err(ControllerError::UnknownMode(mode.to_string()));
        };

        {
            let mut map = core.registry.map.lock().unwrap();
            for (name, entry) in map.iter_mut() {
                entry.active = active.contains(name);
            }
            core.registry.changed.notify_all();
        }

        core.set_status(|s| s.mode = mode.to_string());
        core.keymaster
            .put("controller.mode", Value::String(mode.into()))?;
        tracing::info!(
            "[Controller] system mode '{}', active: {:?}",
            mode,
            active.iter().collect::<Vec<_>>()
        );
        Ok(())
    }

    /// `init`: drive all active components `Created -> Standby`.
    pub fn initialize(&self) -> ControllerResult<()> {
        self.lifecycle(ControllerEvent::Init, ComponentEvent::Init, "Standby")
    }

    /// `get_ready`: drive all active components `Standby -> Ready`.
    pub fn ready(&self) -> ControllerResult<()> {
        self.lifecycle(ControllerEvent::GetReady, ComponentEvent::DoReady, "Ready")
    }

    /// `start`: drive all active components `Ready -> Running`.
    pub fn start(&self) -> ControllerResult<()> {
        self.lifecycle(ControllerEvent::Start, ComponentEvent::Start, "Running")
    }

    /// `stop`: drive all active components `Running -> Ready`.
    pub fn stop(&self) -> ControllerResult<()> {
        self.lifecycle(ControllerEvent::Stop, ComponentEvent::Stop, "Ready")
    }

    /// `do_standby`: drive all active components `Ready -> Standby`.
    pub fn standby(&self) -> ControllerResult<()> {
        self.lifecycle(
            ControllerEvent::DoStandby,
            ComponentEvent::DoStandby,
            "Standby",
        )
    }

    /// `exit`: drive all active components to `Exiting`.
    pub fn exit_system(&self) -> ControllerResult<()> {
        self.lifecycle(ControllerEvent::Exit, ComponentEvent::Exit, "Exiting")
    }

    /// Inject an event into the global FSM without fan-out. Intended
    /// for user-defined transitions registered via
    /// [`add_transition`](Self::add_transition).
    pub fn send_event(&self, event: &str) -> ControllerResult<()> {
        let core = self.core(event)?;
        let _op = core.op_lock.lock().unwrap();

        let snapshot = core.registry.snapshot();
        let mut fsm = core.fsm.lock().unwrap();
        if fsm.handle_event(ControllerEvent::parse(event), &snapshot) {
            Ok(())
        } else {
            Err(ControllerError::InvalidState {
                event: event.into(),
                state: fsm.state().as_str().into(),
            })
        }
    }

    /// Snapshot check: every active component's last observed state
    /// equals `state`.
    pub fn check_all_in_state(&self, state: &str) -> bool {
        let Some(core) = self.core.as_ref() else {
            return false;
        };
        let map = core.registry.map.lock().unwrap();
        map.values().filter(|e| e.active).all(|e| e.state == state)
    }

    /// Block until every active component reaches `state`. `None`
    /// waits indefinitely; returns `false` on timeout or termination.
    pub fn wait_all_in_state(&self, state: &str, timeout: Option<Duration>) -> bool {
        let Some(core) = self.core.as_ref() else {
            return false;
        };
        let registry = &core.registry;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut map = registry.map.lock().unwrap();
        loop {
            // Once the controller is terminating the quorum can never
            // form again; bail out even if the emptied registry would
            // make the predicate vacuously true.
            if registry.done.load(Ordering::Relaxed) {
                return false;
            }
            if map.values().filter(|e| e.active).all(|e| e.state == state) {
                return true;
            }
            match deadline {
                None => map = registry.changed.wait(map).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = registry.changed.wait_timeout(map, deadline - now).unwrap();
                    map = guard;
                }
            }
        }
    }

    /// Names of the components active in the current mode.
    pub fn active_components(&self) -> Vec<String> {
        let Some(core) = self.core.as_ref() else {
            return Vec::new();
        };
        let map = core.registry.map.lock().unwrap();
        map.iter()
            .filter(|(_, e)| e.active)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Current status snapshot (state, mode, degraded flag).
    pub fn status(&self) -> Arc<ControllerStatus> {
        match self.core.as_ref() {
            Some(core) => core.status.load(),
            None => Arc::new(ControllerStatus::default()),
        }
    }

    /// State reports dropped because the report FIFO was full.
    pub fn dropped_reports(&self) -> u64 {
        self.core
            .as_ref()
            .map(|c| c.dropped_reports.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// The keymaster url components were given. Empty before
    /// `basic_init`.
    pub fn keymaster_url(&self) -> &str {
        self.core
            .as_ref()
            .map(|c| c.keymaster_url.as_str())
            .unwrap_or("")
    }

    /// Shut the system down: command `exit` to every component, wait
    /// (bounded) for them to reach `Exiting`, stop the service thread
    /// and destroy the components. Idempotent; also unblocks any thread
    /// parked in [`wait_all_in_state`](Self::wait_all_in_state).
    pub fn terminate(&self) {
        let Some(core) = self.core.as_ref() else {
            return;
        };
        if core.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("[Controller] terminating");

        // Unblock external quorum waiters before anything else.
        core.registry.done.store(true, Ordering::Relaxed);
        {
            let _map = core.registry.map.lock().unwrap();
            core.registry.changed.notify_all();
        }

        let _op = core.op_lock.lock().unwrap();

        {
            let map = core.registry.map.lock().unwrap();
            for (name, entry) in map.iter() {
                if let Err(err) = entry.instance.command(ComponentEvent::Exit) {
                    tracing::warn!("[Controller] exit command to '{}' failed: {:#}", name, err);
                }
            }
        }

        // Bounded wait for everything to report Exiting; the service
        // thread is still delivering reports at this point.
        let deadline =
            Instant::now() + Duration::from_millis(core.cfg.stop_timeout_ms.unwrap_or(5_000));
        {
            let mut map = core.registry.map.lock().unwrap();
            loop {
                if map.values().all(|e| e.state == "Exiting") {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    let stuck: Vec<&String> = map
                        .iter()
                        .filter(|(_, e)| e.state != "Exiting")
                        .map(|(n, _)| n)
                        .collect();
                    tracing::warn!("[Controller] components still shutting down: {:?}", stuck);
                    break;
                }
                let (guard, _) = core
                    .registry
                    .changed
                    .wait_timeout(map, deadline - now)
                    .unwrap();
                map = guard;
            }
        }

        core.report_fifo.release();
        if let Some(handle) = core.service.lock().unwrap().take() {
            let _ = handle.join();
        }
        core.keymaster.unsubscribe_all();

        {
            let mut map = core.registry.map.lock().unwrap();
            for entry in map.values_mut() {
                entry.instance.shutdown();
            }
            map.clear();
        }

        {
            let mut fsm = core.fsm.lock().unwrap();
            if *fsm.state() != ControllerState::Exiting {
                fsm.handle_event(ControllerEvent::Exit, &StateSnapshot::default());
            }
        }

        tracing::info!("[Controller] terminated");
    }

    fn core(&self, op: &str) -> ControllerResult<&Core> {
        self.core.as_ref().ok_or_else(|| ControllerError::InvalidState {
            event: op.to_string(),
            state: "Uninitialized".into(),
        })
    }

    /// Shared lifecycle template: fire the FSM, fan the event out to
    /// active components in registry order, wait for the quorum.
    fn lifecycle(
        &self,
        event: ControllerEvent,
        component_event: ComponentEvent,
        expected: &str,
    ) -> ControllerResult<()> {
        let core = self.core(&event.to_string())?;
        let _op = core.op_lock.lock().unwrap();

        let snapshot = core.registry.snapshot();
        {
            let mut fsm = core.fsm.lock().unwrap();
            if !fsm.handle_event(event.clone(), &snapshot) {
                return Err(ControllerError::InvalidState {
                    event: event.to_string(),
                    state: fsm.state().as_str().into(),
                });
            }
        }

        {
            let map = core.registry.map.lock().unwrap();
            for (name, entry) in map.iter() {
                if !entry.active {
                    continue;
                }
                if let Err(err) = entry.instance.command(component_event) {
                    tracing::error!(
                        "[Controller] '{}' command to '{}' failed: {:#}",
                        component_event,
                        name,
                        err
                    );
                }
            }
        }

        let timeout = Duration::from_millis(core.cfg.quorum_timeout_ms.unwrap_or(5_000));
        if self.wait_all_in_state(expected, Some(timeout)) {
            core.set_status(|s| s.degraded = false);
            core.keymaster
                .put("controller.status", Value::String("ok".into()))
                .ok();
            tracing::info!(
                "[Controller] '{}' complete, all active components {}",
                event,
                expected
            );
            return Ok(());
        }

        // No rollback: the FSM keeps the reached state and the system
        // is reported degraded.
        let mut pending = Vec::new();
        let mut component_error: Option<(String, String)> = None;
        {
            let map = core.registry.map.lock().unwrap();
            for (name, entry) in map.iter() {
                if entry.active && entry.state != expected {
                    if component_error.is_none() && entry.status.starts_with("error") {
                        component_error = Some((name.clone(), entry.status.clone()));
                    }
                    pending.push(name.clone());
                }
            }
        }

        core.set_status(|s| s.degraded = true);
        core.keymaster
            .put("controller.status", Value::String("degraded".into()))
            .ok();
        tracing::warn!(
            "[Controller] '{}' quorum timeout, pending: {:?}",
            event,
            pending
        );

        match component_error {
            Some((name, status)) => Err(ControllerError::Component { name, status }),
            None => Err(ControllerError::QuorumTimeout {
                expected: expected.into(),
                pending,
            }),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Parse the `components` section into `(name, type)` pairs.
fn declared_components(tree: &Value) -> ControllerResult<Vec<(String, String)>> {
    let section = tree
        .get("components")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ControllerError::ConfigurationMalformed("missing 'components' section".into())
        })?;

    let mut declared = Vec::with_capacity(section.len());
    for (name, node) in section {
        let kind = node.get("type").and_then(Value::as_str).ok_or_else(|| {
            ControllerError::ConfigurationMalformed(format!(
                "components.{name}.type must be a string"
            ))
        })?;
        declared.push((name.clone(), kind.to_string()));
    }
    Ok(declared)
}

/// Derive, per mode, the set of component names appearing in any
/// endpoint of any connection of that mode.
fn derive_mode_sets(
    tree: &Value,
    declared: &[(String, String)],
) -> ControllerResult<BTreeMap<String, BTreeSet<String>>> {
    let mut mode_sets = BTreeMap::new();
    let Some(section) = tree.get("connections") else {
        return Ok(mode_sets);
    };
    let section = section.as_object().ok_or_else(|| {
        ControllerError::ConfigurationMalformed("'connections' must be a map".into())
    })?;

    for (mode, connections) in section {
        let connections = connections.as_array().ok_or_else(|| {
            ControllerError::ConfigurationMalformed(format!("connections.{mode} must be a list"))
        })?;

        let mut active = BTreeSet::new();
        for connection in connections {
            let endpoints = connection.as_array().ok_or_else(|| {
                ControllerError::ConfigurationMalformed(format!(
                    "connections.{mode} entries must be endpoint lists"
                ))
            })?;
            for endpoint in endpoints {
                let endpoint = endpoint.as_str().ok_or_else(|| {
                    ControllerError::ConfigurationMalformed(format!(
                        "connections.{mode} endpoints must be 'component.channel' strings"
                    ))
                })?;
                let component = endpoint
                    .split_once('.')
                    .map(|(c, _)| c)
                    .unwrap_or(endpoint);
                if declared.iter().any(|(name, _)| name.as_str() == component) {
                    active.insert(component.to_string());
                } else {
                    tracing::warn!(
                        "[Controller] connections.{}: unknown component '{}' ignored",
                        mode,
                        component
                    );
                }
            }
        }
        mode_sets.insert(mode.clone(), active);
    }
    Ok(mode_sets)
}

/// Build the global FSM. Lifecycle transitions are guarded by quorum
/// predicates over the snapshot; entry actions publish
/// `controller.state`.
fn build_fsm(
    keymaster: Keymaster,
    status: Arc<StateCell<ControllerStatus>>,
    extra: Vec<Transition<ControllerState, ControllerEvent, StateSnapshot>>,
) -> ControllerFsm {
    use ControllerEvent as Ev;
    use ControllerState as St;

    let mut fsm = Fsm::new(St::Created);

    let lifecycle: [(St, Ev, St, &'static str); 5] = [
        (St::Created, Ev::Init, St::Standby, "Created"),
        (St::Standby, Ev::GetReady, St::Ready, "Standby"),
        (St::Ready, Ev::Start, St::Running, "Ready"),
        (St::Running, Ev::Stop, St::Ready, "Running"),
        (St::Ready, Ev::DoStandby, St::Standby, "Ready"),
    ];
    for (from, event, to, required) in lifecycle {
        fsm.add_transition(
            Transition::new(from, event, to)
                .guarded(move |snap: &StateSnapshot| snap.all_active_in(required)),
        );
    }
    for from in [St::Created, St::Standby, St::Ready, St::Running] {
        fsm.add_transition(Transition::new(from, Ev::Exit, St::Exiting));
    }
    for transition in extra {
        fsm.add_transition(transition);
    }

    for state in [St::Created, St::Standby, St::Ready, St::Running, St::Exiting] {
        let keymaster = keymaster.clone();
        let status = status.clone();
        fsm.set_entry(state, move |_snap, _queue| {
            let mut next = (*status.load()).clone();
            next.state = state;
            status.publish(next);
            if let Err(err) =
                keymaster.put("controller.state", Value::String(state.as_str().into()))
            {
                tracing::error!("[Controller] failed to publish state: {}", err);
            }
        });
    }

    fsm
}

/// Drain state reports into the registry and re-evaluate the global
/// FSM. Runs on the dedicated `controller-state` thread; ends when the
/// report FIFO is released.
fn service_loop(
    fifo: SemFifo<StateReport>,
    registry: Arc<Registry>,
    fsm: Arc<Mutex<ControllerFsm>>,
) {
    tracing::debug!("[Controller] service thread started");

    while let Some(report) = fifo.get() {
        let text = report
            .value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| report.value.to_string());

        {
            let mut map = registry.map.lock().unwrap();
            match map.get_mut(&report.component) {
                Some(entry) => match report.kind {
                    ReportKind::State => {
                        tracing::debug!("[Controller] {} -> {}", report.component, text);
                        entry.state = text;
                    }
                    ReportKind::Status => entry.status = text,
                },
                None => {
                    tracing::warn!(
                        "[Controller] report for unknown component '{}'",
                        report.component
                    );
                }
            }
            registry.changed.notify_all();
        }

        // Re-check guards with a fresh snapshot; lock order is registry
        // before FSM, and here they never overlap at all.
        let snapshot = registry.snapshot();
        fsm.lock()
            .unwrap()
            .handle_event(ControllerEvent::StateReport, &snapshot);
    }

    tracing::debug!("[Controller] service thread exiting");
}
