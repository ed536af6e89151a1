use crate::component::{BaseComponent, ComponentEvent, ComponentFactory, ComponentState};
use crate::fsm::{Fsm, Transition};
use crate::io::SemFifo;
use crate::keymaster::Keymaster;
use crate::utils::{HealthFlag, StateCell};
use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Command queue bound when the configuration does not say otherwise.
pub const DEFAULT_COMMAND_CAPACITY: usize = 16;

/// Generic lifecycle worker: the provided [`BaseComponent`]
/// implementation.
///
/// On construction it connects its own keymaster client, reads its
/// configuration subtree, publishes `Created`, subscribes to its
/// command node and spawns a worker thread that drains commands into
/// the per-instance lifecycle FSM. Every fired transition is written
/// back to `components.<name>.state`; a rejected event is reported
/// through `components.<name>.status` and leaves the state untouched.
pub struct WorkerComponent {
    name: String,
    kind: String,
    km: Keymaster,
    config: Value,
    cmd_fifo: SemFifo<ComponentEvent>,
    state_cell: Arc<StateCell<ComponentState>>,
    health: HealthFlag,
    worker: Option<JoinHandle<()>>,
}

impl WorkerComponent {
    pub fn start(kind: &str, name: &str, keymaster_url: &str) -> anyhow::Result<Self> {
        let km = Keymaster::connect(keymaster_url)?;

        let config = km
            .get(&format!("components.{name}"))
            .with_context(|| format!("component '{name}' has no configuration subtree"))?;

        let capacity = config
            .get("command_queue")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_COMMAND_CAPACITY);

        let cmd_fifo = SemFifo::new(capacity);
        let state_cell = StateCell::new_arc(ComponentState::Created);
        let health = HealthFlag::new(true);

        km.put(
            &format!("components.{name}.state"),
            Value::String(ComponentState::Created.as_str().into()),
        )?;
        km.put(&format!("components.{name}.status"), Value::String("ok".into()))?;

        km.subscribe(&format!("components.{name}.command"), {
            let fifo = cmd_fifo.clone();
            let cname = name.to_string();
            move |_, node| {
                let Some(event) = node.as_str().and_then(|s| s.parse::<ComponentEvent>().ok())
                else {
                    tracing::warn!("[{}] unparseable command: {}", cname, node);
                    return;
                };
                if let Err(err) = fifo.try_put(event) {
                    tracing::warn!(
                        "[{}] command queue refused '{}': {}",
                        cname,
                        err.value,
                        err.reason
                    );
                }
            }
        })?;

        let worker = thread::Builder::new().name(format!("{kind}-{name}")).spawn({
            let km = km.clone();
            let fifo = cmd_fifo.clone();
            let cell = state_cell.clone();
            let health = health.clone();
            let name = name.to_string();
            move || {
                run_worker(&name, &km, &fifo, &cell);
                health.down();
            }
        })?;

        tracing::info!("[{}] component created (type {})", name, kind);

        Ok(Self {
            name: name.to_string(),
            kind: kind.to_string(),
            km,
            config,
            cmd_fifo,
            state_cell,
            health,
            worker: Some(worker),
        })
    }

    /// Factory for registering this implementation under a type name.
    pub fn factory() -> ComponentFactory {
        Arc::new(|kind, name, url| {
            WorkerComponent::start(kind, name, url).map(|c| Box::new(c) as Box<dyn BaseComponent>)
        })
    }

    /// The component's configuration subtree as read at construction.
    pub fn config(&self) -> &Value {
        &self.config
    }
}

impl BaseComponent for WorkerComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn command(&self, event: ComponentEvent) -> anyhow::Result<()> {
        self.km
            .put(
                &format!("components.{}.command", self.name),
                Value::String(event.as_str().into()),
            )
            .map_err(anyhow::Error::from)
    }

    fn current_state(&self) -> ComponentState {
        *self.state_cell.load()
    }

    fn is_healthy(&self) -> bool {
        self.health.get()
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };

        if self.current_state() != ComponentState::Exiting {
            let _ = self.command(ComponentEvent::Exit);
            // Give the worker a chance to drain the exit cooperatively.
            self.cmd_fifo.wait_for_empty(Some(Duration::from_millis(500)));
        }

        self.cmd_fifo.release();
        if handle.join().is_err() {
            tracing::error!("[{}] worker thread panicked", self.name);
        }
        self.health.down();
        self.km.unsubscribe_all();
        tracing::debug!("[{}] component shut down", self.name);
    }
}

impl Drop for WorkerComponent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lifecycle_fsm() -> Fsm<ComponentState, ComponentEvent, ()> {
    use ComponentEvent::*;
    use ComponentState::*;

    let mut fsm = Fsm::new(Created);
    fsm.add_transition(Transition::new(Created, Init, Standby));
    fsm.add_transition(Transition::new(Standby, DoReady, Ready));
    fsm.add_transition(Transition::new(Ready, Start, Running));
    fsm.add_transition(Transition::new(Running, Stop, Ready));
    fsm.add_transition(Transition::new(Ready, DoStandby, Standby));
    for state in [Created, Standby, Ready, Running] {
        fsm.add_transition(Transition::new(state, Exit, Exiting));
    }
    fsm
}

fn run_worker(
    name: &str,
    km: &Keymaster,
    fifo: &SemFifo<ComponentEvent>,
    cell: &Arc<StateCell<ComponentState>>,
) {
    let mut fsm = lifecycle_fsm();
    let state_path = format!("components.{name}.state");
    let status_path = format!("components.{name}.status");

    while let Some(event) = fifo.get() {
        if fsm.handle_event(event, &()) {
            let state = *fsm.state();
            cell.publish(state);
            if let Err(err) = km.put(&state_path, Value::String(state.as_str().into())) {
                tracing::error!("[{}] failed to publish state: {}", name, err);
                break;
            }
            if state == ComponentState::Exiting {
                break;
            }
        } else {
            let msg = format!(
                "error: event '{}' rejected in state '{}'",
                event,
                fsm.state()
            );
            tracing::error!("[{}] {}", name, msg);
            let _ = km.put(&status_path, Value::String(msg));
        }
    }

    tracing::debug!("[{}] worker loop ended in state {}", name, fsm.state());
}
