use ensemble_rt::prelude::*;
use serde_json::json;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Minimal end-to-end run: two worker components wired into a single
/// capture mode, driven through the full lifecycle. Stop with ctrl-c.
fn main() -> anyhow::Result<()> {
    let _log_guard = LoggerConfig::from_env().init()?;

    let tree = json!({
        "components": {
            "camera": {"type": "camera"},
            "recorder": {"type": "recorder"}
        },
        "connections": {
            "capture": [["camera.frames", "recorder.in"]]
        }
    });

    let mut controller = Controller::from_value(tree);
    controller.add_component_factory("camera", WorkerComponent::factory());
    controller.add_component_factory("recorder", WorkerComponent::factory());

    controller.basic_init()?;
    controller.initialize()?;
    controller.set_system_mode("capture")?;
    controller.ready()?;
    controller.start()?;
    tracing::info!("capture running, send SIGINT/SIGTERM to stop");

    let term = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register(*sig, term.clone())?;
    }
    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    controller.stop()?;
    controller.standby()?;
    controller.terminate();
    Ok(())
}
