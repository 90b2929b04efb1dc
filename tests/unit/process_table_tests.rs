//! Unit tests for the system process table.

use channel_supervisor::process_table::{pid_alive, ProcessTable, SystemProcessTable};

#[test]
fn own_process_is_listed_and_alive() {
    let table = SystemProcessTable::new();
    let own = std::process::id();

    let entries = table.list();

    assert!(entries.iter().any(|entry| entry.pid == own));
    assert!(table.is_alive(own));
}

#[cfg(unix)]
#[test]
fn exited_child_is_not_alive_and_signals_are_ignored() {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait");

    assert!(!pid_alive(pid));
    let table = SystemProcessTable::new();
    table.terminate(pid).expect("signalling a gone process is not an error");
    table.kill(pid).expect("signalling a gone process is not an error");
}

#[cfg(unix)]
#[test]
fn terminate_stops_a_sleeping_child() {
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");
    let pid = child.id();
    let table = SystemProcessTable::new();
    assert!(table.is_alive(pid));

    table.terminate(pid).expect("terminate");
    let status = child.wait().expect("wait");

    assert!(!status.success());
    assert!(!table.is_alive(pid));
}
