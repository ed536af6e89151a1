use serde::{Deserialize, Serialize};

/// Tuning knobs for the controller, read from the `controller` section
/// of the configuration document. Keeps lifecycle and back-pressure
/// knobs small and explicit; a missing section means all defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Capacity of the state-report FIFO fed by subscription
    /// callbacks (`None` = 100).
    pub state_fifo_capacity: Option<usize>,

    /// How long lifecycle calls wait for the active-component quorum,
    /// in milliseconds (`None` = 5000).
    pub quorum_timeout_ms: Option<u64>,

    /// How long `basic_init` waits for every component to report
    /// `Created`, in milliseconds (`None` = 5000).
    pub init_timeout_ms: Option<u64>,

    /// How long `terminate` waits for components to reach `Exiting`,
    /// in milliseconds (`None` = 5000).
    pub stop_timeout_ms: Option<u64>,
}
