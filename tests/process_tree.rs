use autopin::os::proc_fs::ProcEnumerator;
use autopin::{ProcessTree, TaskSet};
use std::process::Command;
use std::time::Duration;

#[test_log::test]
fn test_tree_of_shell_with_background_child() {
    let mut shell = Command::new("sh")
        .args(["-c", "sleep 5 & wait"])
        .spawn()
        .unwrap();
    let root = shell.id() as i32;
    let enumerator = ProcEnumerator::new();

    // Enumeration fails as a whole when a host process vanishes mid-scan, and the shell needs a
    // moment to fork
    let tree = (0..100)
        .find_map(|_| {
            std::thread::sleep(Duration::from_millis(20));
            ProcessTree::build(&enumerator, root)
                .ok()
                .filter(|tree| tree.children(root).count() == 1)
        })
        .expect("the background child never showed up");

    let sleep = tree.children(root).next().unwrap();
    assert_eq!(tree.processes().collect::<TaskSet>(), TaskSet::from([root, sleep]));
    assert_eq!(tree.tasks(root), Some(&TaskSet::from([root])));

    let json: serde_json::Value = serde_json::from_str(&tree.to_json().unwrap()).unwrap();
    assert_eq!(json["root"], root);

    let _ = Command::new("kill").arg(sleep.to_string()).status();
    let _ = shell.kill();
    let _ = shell.wait();
}

#[test_log::test]
fn test_tree_of_missing_process() {
    assert!(ProcessTree::build(&ProcEnumerator::new(), i32::MAX).is_err());
}
