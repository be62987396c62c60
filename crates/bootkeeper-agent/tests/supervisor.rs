//! End-to-end supervisor behavior against real `bash` children.

use std::time::Duration;

use bootkeeper_agent::{SlotRegistry, SlotSpec, Supervisor, SupervisorConfig, SupervisorError};
use bootkeeper_process::{ConnectionStatus, SlotId, SlotOutcome, SlotState, SupervisorEvent};

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        stop_grace: Duration::from_millis(500),
        restart_drain: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
        autostart_delay: Duration::from_millis(50),
        autostart_enabled: false,
        shell: "bash".to_string(),
    }
}

fn supervisor(specs: Vec<SlotSpec>) -> Supervisor {
    Supervisor::new(SlotRegistry::new(specs).unwrap(), fast_config())
}

/// Polls until the slot's newest line equals `last`.
async fn wait_for_last_line(sup: &Supervisor, id: u32, last: &str) -> Vec<String> {
    for _ in 0..200 {
        let lines = sup.recent_output(SlotId(id), 1000).await.unwrap();
        if lines.last().map(String::as_str) == Some(last) {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("slot {id} never printed {last:?}");
}

#[tokio::test]
async fn echo_ready_scenario() {
    let sup = supervisor(vec![SlotSpec::new(1, "echo", "echo ready")]);
    sup.start(SlotId(1)).await.unwrap();

    let mut stopped = false;
    for _ in 0..200 {
        if !sup.status(SlotId(1)).await.unwrap() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(stopped);
    assert_eq!(wait_for_last_line(&sup, 1, "ready").await, vec!["ready"]);
}

#[tokio::test]
async fn invalid_and_idle_slots() {
    let sup = supervisor(vec![
        SlotSpec::new(1, "one", "sleep 30"),
        SlotSpec::new(2, "two", "sleep 30"),
    ]);
    sup.start(SlotId(1)).await.unwrap();

    assert!(matches!(
        sup.start(SlotId(99)).await,
        Err(SupervisorError::InvalidSlot(SlotId(99)))
    ));
    assert!(sup.status(SlotId(1)).await.unwrap());
    assert!(!sup.status(SlotId(2)).await.unwrap());

    assert!(matches!(
        sup.stop(SlotId(2)).await,
        Err(SupervisorError::NotRunning(SlotId(2)))
    ));

    sup.stop(SlotId(1)).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn restart_leaves_exactly_one_process_group() {
    use bootkeeper_agent::process_handle::group_alive;

    let sup = supervisor(vec![SlotSpec::new(1, "sleeper", "sleep 30")]);
    sup.start(SlotId(1)).await.unwrap();
    let old = sup.slot_status(SlotId(1)).await.unwrap().pgid.unwrap();

    sup.start(SlotId(1)).await.unwrap();
    let new = sup.slot_status(SlotId(1)).await.unwrap().pgid.unwrap();

    assert_ne!(old, new);
    assert!(!group_alive(old));
    assert!(group_alive(new));
    assert!(sup.status(SlotId(1)).await.unwrap());

    sup.stop(SlotId(1)).await.unwrap();
    assert!(!group_alive(new));
}

#[tokio::test]
async fn output_buffer_is_bounded_fifo() {
    let sup = supervisor(vec![SlotSpec::new(1, "chatty", "seq 1 500")]);
    sup.start(SlotId(1)).await.unwrap();

    let lines = wait_for_last_line(&sup, 1, "500").await;
    assert_eq!(lines.len(), 100);
    assert_eq!(lines.first().map(String::as_str), Some("401"));
}

#[tokio::test]
async fn connect_replays_tail_in_slot_order() {
    let sup = supervisor(vec![
        SlotSpec::new(1, "many", "seq 1 8"),
        SlotSpec::new(2, "one", "echo only"),
        SlotSpec::new(3, "idle", "true"),
    ]);
    sup.start(SlotId(1)).await.unwrap();
    sup.start(SlotId(2)).await.unwrap();
    wait_for_last_line(&sup, 1, "8").await;
    wait_for_last_line(&sup, 2, "only").await;

    let mut sub = sup.subscribe().await;
    assert!(matches!(
        sub.recv().await,
        Some(SupervisorEvent::Connection(ConnectionStatus::Connected { .. }))
    ));

    let mut replay = Vec::new();
    while let Some(ev) = sub.try_recv() {
        match ev {
            SupervisorEvent::Output(o) => replay.push((o.slot.0, o.line)),
            other => panic!("unexpected event {other:?}"),
        }
    }
    let expected: Vec<(u32, String)> = ["4", "5", "6", "7", "8"]
        .iter()
        .map(|l| (1, l.to_string()))
        .chain(std::iter::once((2, "only".to_string())))
        .collect();
    assert_eq!(replay, expected);
}

#[tokio::test]
async fn live_output_follows_the_replay() {
    let sup = supervisor(vec![SlotSpec::new(1, "late", "sleep 0.3; echo late")]);
    let mut sub = sup.subscribe().await;
    assert!(matches!(
        sub.recv().await,
        Some(SupervisorEvent::Connection(_))
    ));

    sup.start(SlotId(1)).await.unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap();
    match ev {
        Some(SupervisorEvent::Output(o)) => {
            assert_eq!(o.slot, SlotId(1));
            assert_eq!(o.line, "late");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn start_all_respects_order_and_settle_delays() {
    let sup = supervisor(vec![
        SlotSpec::new(2, "second", "sleep 5").with_settle_delay(Duration::from_millis(300)),
        SlotSpec::new(1, "first", "sleep 5").with_settle_delay(Duration::from_millis(200)),
        SlotSpec::new(3, "third", "sleep 5").with_settle_delay(Duration::from_millis(10)),
    ]);

    let results = sup.start_all().await;
    let ids: Vec<u32> = results.keys().map(|id| id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(results.values().all(|o| *o == SlotOutcome::Started));

    let statuses = sup.statuses().await;
    let at: Vec<_> = statuses.iter().map(|s| s.started_at.unwrap()).collect();
    assert!(at[1] - at[0] >= chrono::Duration::milliseconds(200));
    assert!(at[2] - at[1] >= chrono::Duration::milliseconds(300));

    let stopped = sup.stop_all().await;
    assert!(stopped.values().all(|o| *o == SlotOutcome::Stopped));
    for id in 1..=3 {
        assert!(!sup.status(SlotId(id)).await.unwrap());
        assert_eq!(sup.state(SlotId(id)).await.unwrap(), SlotState::Stopped);
    }
}

#[tokio::test]
async fn stop_all_lets_cooperative_slots_exit_on_sigint() {
    let config = SupervisorConfig {
        stop_grace: Duration::from_secs(3),
        ..fast_config()
    };
    let cooperative = "trap 'echo interrupted; exit 0' INT; echo armed; while true; do sleep 0.05; done";
    let sup = Supervisor::new(
        SlotRegistry::new([
            SlotSpec::new(1, "first", cooperative),
            SlotSpec::new(2, "second", cooperative),
        ])
        .unwrap(),
        config,
    );
    sup.start(SlotId(1)).await.unwrap();
    sup.start(SlotId(2)).await.unwrap();
    wait_for_last_line(&sup, 1, "armed").await;
    wait_for_last_line(&sup, 2, "armed").await;

    let started = tokio::time::Instant::now();
    let results = sup.stop_all().await;
    // Escalating to SIGKILL would have taken at least one full grace period.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(results.values().all(|o| *o == SlotOutcome::Stopped));

    for id in 1..=2 {
        assert!(!sup.status(SlotId(id)).await.unwrap());
        assert_eq!(
            wait_for_last_line(&sup, id, "interrupted").await,
            vec!["armed", "interrupted"]
        );
    }
}

#[tokio::test]
async fn stop_all_reports_idle_slots_as_failed() {
    let sup = supervisor(vec![
        SlotSpec::new(1, "running", "sleep 30"),
        SlotSpec::new(2, "idle", "sleep 30"),
    ]);
    sup.start(SlotId(1)).await.unwrap();

    let results = sup.stop_all().await;
    assert_eq!(results[&SlotId(1)], SlotOutcome::Stopped);
    assert!(matches!(results[&SlotId(2)], SlotOutcome::Failed { .. }));
    assert!(!sup.status(SlotId(1)).await.unwrap());
}

#[tokio::test]
async fn failing_init_step_keeps_main_command_from_running() {
    let sup = supervisor(vec![
        SlotSpec::new(1, "guarded", "echo main-ran").with_init(["echo init-ran", "false"]),
    ]);
    sup.start(SlotId(1)).await.unwrap();
    let lines = wait_for_last_line(&sup, 1, "init-ran").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lines, vec!["init-ran"]);
    assert_eq!(
        sup.recent_output(SlotId(1), 10).await.unwrap(),
        vec!["init-ran"]
    );
}
