pub use crate::component::{
    BaseComponent, ComponentEvent, ComponentFactory, ComponentState, ParseLifecycleError,
    WorkerComponent,
};
pub use crate::config::ControllerConfig;
pub use crate::control::{
    ComponentSnapshot, Controller, ControllerEvent, ControllerState, ControllerStatus,
    StateSnapshot,
};
pub use crate::error::{ControllerError, ControllerResult, PutError, PutFailReason};
pub use crate::fsm::{Fsm, Transition};
pub use crate::io::SemFifo;
pub use crate::keymaster::{Keymaster, KeymasterError, KeymasterServer, SubscriptionId};
pub use crate::utils::logger::{LogRotation, LoggerConfig};
pub use crate::utils::{HealthFlag, StateCell};
