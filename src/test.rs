#[cfg(test)]
mod tests {
    use crate::component::{
        BaseComponent, ComponentEvent, ComponentFactory, ComponentState, WorkerComponent,
    };
    use crate::control::{Controller, ControllerState};
    use crate::error::ControllerError;
    use crate::fsm::{Fsm, Transition};
    use crate::io::SemFifo;
    use crate::keymaster::{Keymaster, KeymasterError, KeymasterServer};
    use crate::utils::StateCell;
    use crate::utils::logger::Throttle;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    // ---- helper: poll a predicate with a deadline
    fn wait_until(dur: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < dur {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    fn km_string(km: &Keymaster, path: &str) -> String {
        km.get(path)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    // ================= SemFifo =================

    #[test]
    fn fifo_preserves_order_spsc() {
        let fifo = SemFifo::<u32>::new(8);

        let producer = thread::spawn({
            let fifo = fifo.clone();
            move || {
                for i in 0..1_000 {
                    fifo.put(i).expect("put failed");
                }
            }
        });

        let mut received = Vec::with_capacity(1_000);
        for _ in 0..1_000 {
            received.push(fifo.get().expect("get returned released"));
        }
        producer.join().unwrap();

        assert_eq!(received, (0..1_000).collect::<Vec<_>>());
    }

    #[test]
    fn fifo_respects_capacity() {
        let fifo = SemFifo::<u32>::new(4);
        assert_eq!(fifo.capacity(), 4);

        for i in 0..4 {
            fifo.try_put(i).expect("queue should have room");
        }
        assert_eq!(fifo.len(), 4);

        let err = fifo.try_put(99).expect_err("queue should be full");
        assert!(err.is_full());
        assert_eq!(err.into_value(), 99);

        for i in 0..4 {
            assert_eq!(fifo.try_get(), Some(i));
        }
        assert_eq!(fifo.try_get(), None);
        assert!(fifo.is_empty());
    }

    #[test]
    fn fifo_release_unblocks_blocked_get() {
        let fifo = SemFifo::<u32>::new(4);

        let consumer = thread::spawn({
            let fifo = fifo.clone();
            move || fifo.get()
        });

        thread::sleep(Duration::from_millis(50));
        fifo.release();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn fifo_release_unblocks_blocked_put_and_flush_reprimes() {
        let fifo = SemFifo::<u32>::new(1);
        fifo.put(1).unwrap();

        let producer = thread::spawn({
            let fifo = fifo.clone();
            move || fifo.put(2)
        });

        thread::sleep(Duration::from_millis(50));
        fifo.release();

        let err = producer.join().unwrap().expect_err("put must fail released");
        assert!(err.is_released());
        assert_eq!(err.into_value(), 2);

        // Unusable until flushed.
        assert!(fifo.try_put(3).expect_err("still released").is_released());
        assert_eq!(fifo.get(), None);

        fifo.flush();
        assert!(fifo.is_empty());
        fifo.put(7).unwrap();
        assert_eq!(fifo.get(), Some(7));
    }

    #[test]
    fn fifo_wait_for_empty_times_out_without_consuming() {
        let fifo = SemFifo::<u32>::new(4);
        fifo.put(5).unwrap();

        assert!(!fifo.wait_for_empty(Some(Duration::from_millis(50))));
        assert_eq!(fifo.len(), 1);

        let drainer = thread::spawn({
            let fifo = fifo.clone();
            move || {
                thread::sleep(Duration::from_millis(100));
                fifo.try_get()
            }
        });

        assert!(fifo.wait_for_empty(Some(Duration::from_secs(2))));
        assert_eq!(drainer.join().unwrap(), Some(5));
    }

    #[test]
    fn fifo_contention_four_producers_four_consumers() {
        const PER_PRODUCER: u64 = 10_000;
        let fifo = SemFifo::<u64>::new(10);

        let mut producers = Vec::new();
        for p in 0..4u64 {
            producers.push(thread::spawn({
                let fifo = fifo.clone();
                move || {
                    for i in 0..PER_PRODUCER {
                        fifo.put(p * 1_000_000 + i).expect("released during put");
                    }
                }
            }));
        }

        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            consumers.push(thread::spawn({
                let fifo = fifo.clone();
                let collected = collected.clone();
                move || {
                    let mut local = Vec::new();
                    while let Some(v) = fifo.get() {
                        local.push(v);
                    }
                    collected.lock().unwrap().extend(local);
                }
            }));
        }

        for p in producers {
            p.join().unwrap();
        }
        assert!(fifo.wait_for_empty(Some(Duration::from_secs(10))));
        fifo.release();
        for c in consumers {
            c.join().unwrap();
        }

        let collected = collected.lock().unwrap();
        assert_eq!(collected.len(), 40_000);
        let unique: HashSet<u64> = collected.iter().copied().collect();
        assert_eq!(unique.len(), 40_000, "duplicate or lost items");
    }

    // ================= Fsm =================

    #[test]
    fn fsm_first_eligible_transition_wins() {
        let mut fsm: Fsm<&str, &str, bool> = Fsm::new("a");
        fsm.add_transition(Transition::new("a", "go", "b").guarded(|flag: &bool| *flag));
        fsm.add_transition(Transition::new("a", "go", "c"));

        assert!(fsm.handle_event("go", &true));
        assert_eq!(*fsm.state(), "b");

        let mut fsm: Fsm<&str, &str, bool> = Fsm::new("a");
        fsm.add_transition(Transition::new("a", "go", "b").guarded(|flag: &bool| *flag));
        fsm.add_transition(Transition::new("a", "go", "c"));

        assert!(fsm.handle_event("go", &false));
        assert_eq!(*fsm.state(), "c");
    }

    #[test]
    fn fsm_rejects_events_with_no_eligible_transition() {
        let mut fsm: Fsm<&str, &str, ()> = Fsm::new("a");
        fsm.add_transition(Transition::new("a", "go", "b").guarded(|_| false));

        assert!(!fsm.handle_event("go", &()));
        assert!(!fsm.handle_event("unknown", &()));
        assert_eq!(*fsm.state(), "a");
    }

    #[test]
    fn fsm_queues_reentrant_events_until_action_returns() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut fsm: Fsm<&str, &str, ()> = Fsm::new("a");
        fsm.add_transition(Transition::new("a", "go", "b").with_action({
            let order = order.clone();
            move |_, queue| {
                order.lock().unwrap().push("action");
                queue.push_back("next");
            }
        }));
        fsm.add_transition(Transition::new("b", "next", "c"));
        fsm.set_entry("b", {
            let order = order.clone();
            move |_, _| order.lock().unwrap().push("enter-b")
        });

        assert!(fsm.handle_event("go", &()));
        assert_eq!(*fsm.state(), "c");
        assert_eq!(*order.lock().unwrap(), ["action", "enter-b"]);
    }

    // ================= Keymaster =================

    #[test]
    fn keymaster_get_put_roundtrip() {
        let server = KeymasterServer::with_tree(json!({"a": {"b": 1}})).unwrap();
        let km = Keymaster::connect(server.url()).unwrap();

        assert_eq!(km.get("a.b").unwrap(), json!(1));
        km.put("a.c.d", json!("x")).unwrap();
        assert_eq!(km.get("a.c").unwrap(), json!({"d": "x"}));

        assert!(matches!(km.get("nope"), Err(KeymasterError::NoSuchKey(_))));
        assert!(matches!(
            Keymaster::connect("mem://gone"),
            Err(KeymasterError::Connect(_))
        ));
    }

    #[test]
    fn keymaster_delivers_descendant_changes_in_write_order() {
        let server = KeymasterServer::with_tree(json!({})).unwrap();
        let km = Keymaster::connect(server.url()).unwrap();

        let got: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        km.subscribe("sensor", {
            let got = got.clone();
            move |path, value| got.lock().unwrap().push((path.to_string(), value.clone()))
        })
        .unwrap();

        for i in 0..50 {
            km.put("sensor.reading", json!(i)).unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || got.lock().unwrap().len() == 50));
        {
            let got = got.lock().unwrap();
            for (i, (path, value)) in got.iter().enumerate() {
                assert_eq!(path, "sensor.reading");
                assert_eq!(*value, json!(i));
            }
        }

        // Unsubscribed paths stay quiet.
        km.unsubscribe("sensor").unwrap();
        km.put("sensor.reading", json!(99)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(got.lock().unwrap().len(), 50);
    }

    #[test]
    fn throttle_admits_one_message_per_interval() {
        let throttle = Throttle::new(Duration::from_secs(60));
        assert_eq!(throttle.admit(), Some(0));
        assert_eq!(throttle.admit(), None);
        assert_eq!(throttle.admit(), None);

        // A zero interval never suppresses.
        let throttle = Throttle::new(Duration::ZERO);
        assert_eq!(throttle.admit(), Some(0));
        assert_eq!(throttle.admit(), Some(0));
    }

    #[test]
    fn lifecycle_names_round_trip_through_from_str() {
        for state in [
            ComponentState::Created,
            ComponentState::Standby,
            ComponentState::Ready,
            ComponentState::Running,
            ComponentState::Exiting,
        ] {
            assert_eq!(state.as_str().parse::<ComponentState>(), Ok(state));
        }
        for event in [
            ComponentEvent::Init,
            ComponentEvent::DoReady,
            ComponentEvent::Start,
            ComponentEvent::Stop,
            ComponentEvent::DoStandby,
            ComponentEvent::Exit,
        ] {
            assert_eq!(event.as_str().parse::<ComponentEvent>(), Ok(event));
        }
        assert!("bogus".parse::<ComponentState>().is_err());
        assert!("Standby".parse::<ComponentEvent>().is_err());
    }

    #[test]
    fn state_cell_tracks_changes() {
        let cell = StateCell::new(1u32);
        let seq = cell.seq();
        assert!(!cell.changed_since(seq));

        cell.publish(2);
        assert!(cell.changed_since(seq));
        assert_eq!(*cell.load(), 2);
    }

    // ================= WorkerComponent =================

    #[test]
    fn component_follows_commands_written_to_its_command_node() {
        let server = KeymasterServer::with_tree(json!({"components": {"solo": {}}})).unwrap();
        let comp = WorkerComponent::start("typeX", "solo", server.url()).unwrap();
        let km = Keymaster::connect(server.url()).unwrap();

        assert_eq!(km_string(&km, "components.solo.state"), "Created");

        km.put("components.solo.command", json!("init")).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            km_string(&km, "components.solo.state") == "Standby"
        }));
        assert_eq!(comp.current_state(), ComponentState::Standby);
        assert!(comp.is_healthy());
        drop(comp);
    }

    #[test]
    fn component_reports_rejected_event_via_status() {
        let server = KeymasterServer::with_tree(json!({"components": {"solo": {}}})).unwrap();
        let mut comp = WorkerComponent::start("typeX", "solo", server.url()).unwrap();
        let km = Keymaster::connect(server.url()).unwrap();

        // `start` is unreachable from Created.
        comp.command(ComponentEvent::Start).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            km_string(&km, "components.solo.status").starts_with("error")
        }));
        assert_eq!(comp.current_state(), ComponentState::Created);

        comp.shutdown();
        assert!(!comp.is_healthy());
    }

    // ================= Controller =================

    fn instrument_tree() -> Value {
        json!({
            "components": {
                "c1": {"type": "typeX"},
                "c2": {"type": "typeY"}
            },
            "connections": {
                "A": [["c1.out", "c2.in"]]
            },
            "controller": {
                "quorum_timeout_ms": 2_000,
                "init_timeout_ms": 2_000,
                "stop_timeout_ms": 2_000
            }
        })
    }

    fn worker_controller(tree: Value) -> Controller {
        let mut controller = Controller::from_value(tree);
        controller.add_component_factory("typeX", WorkerComponent::factory());
        controller.add_component_factory("typeY", WorkerComponent::factory());
        controller.add_component_factory("typeZ", WorkerComponent::factory());
        controller
    }

    #[test]
    fn cold_start_two_components_mode_a() {
        let mut controller = worker_controller(instrument_tree());
        controller.basic_init().unwrap();
        assert!(controller.check_all_in_state("Created"));
        assert_eq!(controller.status().state, ControllerState::Created);

        controller.initialize().unwrap();
        assert!(controller.check_all_in_state("Standby"));
        assert_eq!(controller.status().state, ControllerState::Standby);

        controller.set_system_mode("A").unwrap();
        assert_eq!(controller.active_components(), ["c1", "c2"]);
        assert_eq!(controller.status().mode, "A");

        controller.ready().unwrap();
        controller.start().unwrap();
        assert!(controller.check_all_in_state("Running"));

        let km = Keymaster::connect(controller.keymaster_url()).unwrap();
        assert_eq!(km_string(&km, "controller.state"), "Running");
        assert_eq!(km_string(&km, "controller.mode"), "A");
        assert_eq!(km_string(&km, "controller.status"), "ok");

        controller.terminate();
    }

    #[test]
    fn lifecycle_round_trip_returns_to_standby() {
        let mut controller = worker_controller(instrument_tree());
        controller.basic_init().unwrap();
        controller.initialize().unwrap();
        controller.set_system_mode("A").unwrap();

        controller.ready().unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        controller.standby().unwrap();

        assert_eq!(controller.status().state, ControllerState::Standby);
        assert!(controller.check_all_in_state("Standby"));
        assert!(!controller.status().degraded);

        controller.exit_system().unwrap();
        assert!(controller.check_all_in_state("Exiting"));
        controller.terminate();
    }

    #[test]
    fn inactive_component_is_not_commanded_and_not_counted() {
        let mut tree = instrument_tree();
        tree["components"]["c3"] = json!({"type": "typeZ"});

        let mut controller = worker_controller(tree);
        controller.basic_init().unwrap();
        controller.initialize().unwrap();

        controller.set_system_mode("A").unwrap();
        assert_eq!(controller.active_components(), ["c1", "c2"]);

        controller.ready().unwrap();
        assert!(controller.check_all_in_state("Ready"));

        // c3 was never commanded past Standby.
        let km = Keymaster::connect(controller.keymaster_url()).unwrap();
        assert_eq!(km_string(&km, "components.c3.state"), "Standby");

        controller.terminate();
    }

    // A component that accepts init/exit but silently ignores
    // everything else; exercises the trait seam and the degraded path.
    struct StallingComponent {
        name: String,
        kind: String,
        km: Keymaster,
        state: Arc<StateCell<ComponentState>>,
    }

    impl BaseComponent for StallingComponent {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &str {
            &self.kind
        }

        fn command(&self, event: ComponentEvent) -> anyhow::Result<()> {
            let next = match event {
                ComponentEvent::Init => Some(ComponentState::Standby),
                ComponentEvent::Exit => Some(ComponentState::Exiting),
                _ => None,
            };
            if let Some(state) = next {
                self.state.publish(state);
                self.km.put(
                    &format!("components.{}.state", self.name),
                    json!(state.as_str()),
                )?;
            }
            Ok(())
        }

        fn current_state(&self) -> ComponentState {
            *self.state.load()
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn shutdown(&mut self) {}
    }

    fn stalling_factory() -> ComponentFactory {
        Arc::new(|kind, name, url| {
            let km = Keymaster::connect(url)?;
            km.put(&format!("components.{name}.state"), json!("Created"))?;
            km.put(&format!("components.{name}.status"), json!("ok"))?;
            Ok(Box::new(StallingComponent {
                name: name.to_string(),
                kind: kind.to_string(),
                km,
                state: StateCell::new_arc(ComponentState::Created),
            }))
        })
    }

    #[test]
    fn quorum_timeout_marks_degraded_without_rollback() {
        let tree = json!({
            "components": {
                "c1": {"type": "typeX"},
                "c2": {"type": "stall"}
            },
            "connections": {
                "A": [["c1.out", "c2.in"]]
            },
            "controller": {"quorum_timeout_ms": 300}
        });

        let mut controller = Controller::from_value(tree);
        controller.add_component_factory("typeX", WorkerComponent::factory());
        controller.add_component_factory("stall", stalling_factory());

        controller.basic_init().unwrap();
        controller.initialize().unwrap();
        controller.set_system_mode("A").unwrap();

        let err = controller.ready().unwrap_err();
        match err {
            ControllerError::QuorumTimeout { expected, pending } => {
                assert_eq!(expected, "Ready");
                assert_eq!(pending, ["c2"]);
            }
            other => panic!("expected QuorumTimeout, got {other}"),
        }

        // No rollback: the FSM keeps Ready, c1 stays wherever it got.
        assert!(controller.status().degraded);
        assert_eq!(controller.status().state, ControllerState::Ready);

        let km = Keymaster::connect(controller.keymaster_url()).unwrap();
        assert_eq!(km_string(&km, "controller.status"), "degraded");
        assert!(wait_until(Duration::from_secs(2), || {
            km_string(&km, "components.c1.state") == "Ready"
        }));

        controller.terminate();
    }

    #[test]
    fn unknown_mode_is_rejected_without_side_effects() {
        let mut controller = worker_controller(instrument_tree());
        controller.basic_init().unwrap();
        controller.initialize().unwrap();
        controller.set_system_mode("A").unwrap();

        let err = controller.set_system_mode("Z").unwrap_err();
        assert!(matches!(err, ControllerError::UnknownMode(m) if m == "Z"));

        // Active flags and mode untouched.
        assert_eq!(controller.active_components(), ["c1", "c2"]);
        assert_eq!(controller.status().mode, "A");

        controller.terminate();
    }

    #[test]
    fn set_system_mode_requires_standby() {
        let mut controller = worker_controller(instrument_tree());
        controller.basic_init().unwrap();

        let err = controller.set_system_mode("A").unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { .. }));

        controller.terminate();
    }

    #[test]
    fn unknown_component_type_fails_init_with_no_partial_components() {
        let built = Arc::new(AtomicUsize::new(0));
        let counting: ComponentFactory = Arc::new({
            let built = built.clone();
            move |kind, name, url| {
                built.fetch_add(1, Ordering::SeqCst);
                WorkerComponent::start(kind, name, url)
                    .map(|c| Box::new(c) as Box<dyn BaseComponent>)
            }
        });

        let tree = json!({
            "components": {
                "c1": {"type": "typeX"},
                "c4": {"type": "typeW"}
            },
            "connections": {}
        });

        let mut controller = Controller::from_value(tree);
        controller.add_component_factory("typeX", counting);

        let err = controller.basic_init().unwrap_err();
        assert!(matches!(err, ControllerError::UnknownComponentType(k) if k == "typeW"));
        assert_eq!(built.load(Ordering::SeqCst), 0, "no partial construction");
    }

    #[test]
    fn terminate_unblocks_infinite_quorum_wait() {
        let mut controller = worker_controller(instrument_tree());
        controller.basic_init().unwrap();
        controller.initialize().unwrap();

        let controller = Arc::new(controller);
        let waiter = thread::spawn({
            let controller = controller.clone();
            move || controller.wait_all_in_state("Running", None)
        });

        thread::sleep(Duration::from_millis(100));
        controller.terminate();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn lifecycle_calls_outside_legal_states_fail() {
        let mut controller = worker_controller(instrument_tree());
        controller.basic_init().unwrap();

        // get_ready is not legal in Created.
        let err = controller.ready().unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { .. }));

        // basic_init is one-shot.
        let err = controller.basic_init().unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { .. }));

        controller.terminate();
    }

    #[test]
    fn duplicate_factory_registration_returns_previous() {
        let mut controller = Controller::from_value(json!({"components": {}}));
        assert!(
            controller
                .add_component_factory("typeX", WorkerComponent::factory())
                .is_none()
        );
        assert!(
            controller
                .add_component_factory("typeX", WorkerComponent::factory())
                .is_some()
        );
    }

    #[test]
    fn controller_loads_config_from_file() {
        let path = std::env::temp_dir().join(format!(
            "ensemble-rt-test-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "components:\n  c1:\n    type: typeX\nconnections:\n  solo:\n    - [c1.out, c1.in]\n",
        )
        .unwrap();

        let mut controller = Controller::new(path.to_string_lossy());
        controller.add_component_factory("typeX", WorkerComponent::factory());
        controller.basic_init().unwrap();
        controller.initialize().unwrap();
        controller.set_system_mode("solo").unwrap();
        assert_eq!(controller.active_components(), ["c1"]);

        controller.terminate();
        let _ = std::fs::remove_file(&path);
    }
}
