use autopin::ErrorKind;
use autopin::TaskSet;
use autopin::os::signal_bridge::SignalBridge;
use serial_test::serial;
use std::process::Command;
use std::time::Duration;

#[test_log::test(tokio::test)]
#[serial]
async fn test_reports_child_termination() {
    let bridge = SignalBridge::install().unwrap();
    assert!(bridge.is_armed());

    let child = Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    let mut children = TaskSet::from([pid]);

    let mut reaped = Vec::new();
    while reaped.is_empty() {
        reaped = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.next_terminations(&mut children),
        )
        .await
        .unwrap()
        .unwrap();
    }
    assert_eq!(reaped, vec![pid]);
    assert!(children.is_empty());

    bridge.uninstall().unwrap();
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_other_children_are_not_reaped() {
    let bridge = SignalBridge::install().unwrap();

    let mut child = Command::new("true").spawn().unwrap();
    let mut children = TaskSet::new();
    let reaped = tokio::time::timeout(
        Duration::from_secs(5),
        bridge.next_terminations(&mut children),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(reaped.is_empty());

    // The exit status is still there for the owner of the child
    assert!(child.wait().unwrap().success());
    bridge.uninstall().unwrap();
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_only_one_bridge_at_a_time() {
    let bridge = SignalBridge::install().unwrap();

    let err = SignalBridge::install().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::System);
    assert_eq!(err.tag(), "already_initialized");

    drop(bridge);
    SignalBridge::install().unwrap().uninstall().unwrap();
}

#[test_log::test(tokio::test)]
#[serial]
async fn test_released_handler_stops_forwarding() {
    let mut bridge = SignalBridge::install().unwrap();
    bridge.release_handler().unwrap();
    assert!(!bridge.is_armed());

    let mut child = Command::new("true").spawn().unwrap();
    child.wait().unwrap();
    let mut children = TaskSet::new();
    let forwarded = tokio::time::timeout(
        Duration::from_millis(200),
        bridge.next_terminations(&mut children),
    )
    .await;
    assert!(forwarded.is_err());

    bridge.rearm_handler().unwrap();
    assert!(bridge.is_armed());

    let child = Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    let mut children = TaskSet::from([pid]);
    let mut reaped = Vec::new();
    while reaped.is_empty() {
        reaped = tokio::time::timeout(
            Duration::from_secs(5),
            bridge.next_terminations(&mut children),
        )
        .await
        .unwrap()
        .unwrap();
    }
    assert_eq!(reaped, vec![pid]);
}
