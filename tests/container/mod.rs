use crate::common::{fake_pids, Event, RecordingBackend};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use ttyjail::cgroup::{CgroupBackend, ControlScope};
use ttyjail::container::{container_path, Container};
use ttyjail::limits::ResourceLimitTable;
use ttyjail::types::{JailError, MB};

fn new_container(name: &str, backend: &Arc<RecordingBackend>) -> Container {
    let dyn_backend: Arc<dyn CgroupBackend> = backend.clone();
    Container::new(name, 512 * MB, dyn_backend, &ResourceLimitTable::default())
        .expect("Failed to create container")
}

#[test]
fn test_container_creates_top_level_scope() {
    let backend = RecordingBackend::new();
    let container = new_container("python", &backend);

    assert_eq!(container.path(), PathBuf::from("python_container"));
    assert!(backend.exists("python_container"));
    assert_eq!(backend.limit("python_container"), Some(512 * MB));
    assert_eq!(container.sub_scope_limit(), 200 * MB);
    assert!(container.tracked_processes().is_empty());
}

#[test]
fn test_stale_scope_is_deleted_before_creation() {
    let backend = RecordingBackend::new();
    backend.seed("bash_container");

    let _container = new_container("bash", &backend);

    assert_eq!(
        backend.events(),
        vec![
            Event::Delete(PathBuf::from("bash_container")),
            Event::Create(PathBuf::from("bash_container"), 512 * MB),
        ]
    );
}

#[test]
fn test_double_construction_starts_empty() {
    let backend = RecordingBackend::new();
    let first = new_container("node", &backend);
    for pid in fake_pids(5) {
        assert!(first.add_process_to_new_sub_scope(pid, false));
    }
    assert_eq!(first.tracked_processes().len(), 5);

    backend.clear_events();
    let second = new_container("node", &backend);

    assert!(second.tracked_processes().is_empty());
    let events = backend.events();
    assert_eq!(events[0], Event::Delete(container_path("node")));
    assert_eq!(events[1], Event::Create(container_path("node"), 512 * MB));
}

#[test]
fn test_is_process_lifecycle() {
    let backend = RecordingBackend::new();
    let container = new_container("ruby", &backend);

    for pid in fake_pids(32) {
        assert!(!container.is_process(pid));
        assert!(container.add_process_to_new_sub_scope(pid, false));
        assert!(container.is_process(pid), "pid {} should be tracked", pid);

        container.delete_process_from_sub_scope(pid);
        assert!(!container.is_process(pid), "pid {} should be gone", pid);
        // untracked pids are a no-op
        container.delete_process_from_sub_scope(pid);
    }
    assert_eq!(backend.scope_count(), 1);
}

#[test]
fn test_sub_scope_ceiling_doubles_for_compile() {
    let backend = RecordingBackend::new();
    let container = new_container("gcc", &backend);
    let base = ResourceLimitTable::default().memory_limit_bytes("gcc");
    let pids = fake_pids(2);

    assert!(container.add_process_to_new_sub_scope(pids[0], false));
    assert!(container.add_process_to_new_sub_scope(pids[1], true));

    assert_eq!(container.sub_scope_memory_limit(pids[0]), Some(base));
    assert_eq!(container.sub_scope_memory_limit(pids[1]), Some(base * 2));
    let sub_path = container.path().join(pids[1].to_string());
    assert_eq!(backend.limit(&sub_path), Some(base * 2));
    assert_eq!(backend.procs(&sub_path), vec![pids[1].as_raw()]);
}

#[test]
fn test_unknown_command_uses_fallback_ceiling() {
    let backend = RecordingBackend::new();
    let container = new_container("cobol", &backend);
    let table = ResourceLimitTable::default();
    assert_eq!(
        container.sub_scope_limit(),
        table.fallback().memory_mb * MB
    );
    assert!(container.sub_scope_limit() > 0);
}

#[test]
fn test_sub_scope_create_failure_leaves_process_untracked() {
    let backend = RecordingBackend::new();
    let container = new_container("python", &backend);
    backend.fail_sub_scope_create(true);

    let pid = Pid::from_raw(4_242_424);
    assert!(!container.add_process_to_new_sub_scope(pid, false));
    assert!(!container.is_process(pid));
    assert_eq!(backend.scope_count(), 1);

    // the top-level scope still takes the process
    backend.clear_events();
    container.add_process(pid);
    assert_eq!(backend.procs("python_container"), vec![pid.as_raw()]);
}

#[test]
fn test_attach_failure_deletes_orphan_scope() {
    let backend = RecordingBackend::new();
    let container = new_container("python", &backend);
    backend.clear_events();
    backend.fail_attach(true);

    let pid = Pid::from_raw(4_343_434);
    assert!(!container.add_process_to_new_sub_scope(pid, false));

    let sub_path = container.path().join(pid.to_string());
    assert_eq!(
        backend.events(),
        vec![
            Event::Create(sub_path.clone(), 200 * MB),
            Event::Delete(sub_path.clone()),
        ]
    );
    assert!(!backend.exists(&sub_path));
    assert!(!container.is_process(pid));
}

#[test]
fn test_creation_failure_is_container_error() {
    let backend = RecordingBackend::new();
    backend.fail_create(true);
    let dyn_backend: Arc<dyn CgroupBackend> = backend.clone();

    let result = Container::new("bash", MB, dyn_backend, &ResourceLimitTable::default());
    match result {
        Err(JailError::ContainerCreation { name, .. }) => assert_eq!(name, "bash"),
        other => panic!("expected ContainerCreation, got {:?}", other),
    }
}

#[test]
fn test_delete_removes_every_scope() {
    let backend = RecordingBackend::new();
    let container = new_container("sh", &backend);
    for pid in fake_pids(4) {
        container.add_process_to_new_sub_scope(pid, true);
    }
    assert_eq!(backend.scope_count(), 5);

    container.delete();
    assert_eq!(backend.scope_count(), 0);
    assert!(container.tracked_processes().is_empty());
}

#[test]
fn test_concurrent_sub_scope_churn() {
    let backend = RecordingBackend::new();
    let container = Arc::new(new_container("bash", &backend));
    let pids = fake_pids(64);

    let handles: Vec<_> = pids
        .chunks(8)
        .map(|chunk| {
            let container = Arc::clone(&container);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for pid in &chunk {
                    assert!(container.add_process_to_new_sub_scope(*pid, false));
                }
                for pid in chunk.iter().step_by(2) {
                    container.delete_process_from_sub_scope(*pid);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    let tracked = container.tracked_processes();
    assert_eq!(tracked.len(), 32);
    // one sub-scope per tracked pid, plus the top-level scope
    assert_eq!(backend.scope_count(), tracked.len() + 1);
}

#[test]
fn test_kill_sub_scope_spares_only_the_owner() {
    let backend = RecordingBackend::new();
    let container = new_container("sh", &backend);
    let owner = fake_pids(1)[0];
    assert!(container.add_process_to_new_sub_scope(owner, false));

    let mut straggler = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("sleep should start");
    let straggler_pid = Pid::from_raw(straggler.id() as i32);
    let scope_path = container.path().join(owner.to_string());
    backend
        .load(&scope_path)
        .unwrap()
        .attach_process(straggler_pid)
        .unwrap();

    container.kill_sub_scope_processes(owner);

    let status = straggler.wait().unwrap();
    assert_eq!(
        std::os::unix::process::ExitStatusExt::signal(&status),
        Some(libc::SIGKILL)
    );
    // the scope itself is left for delete_process_from_sub_scope
    assert!(container.is_process(owner));
    container.delete_process_from_sub_scope(owner);
    assert!(!backend.exists(&scope_path));
}

#[test]
fn test_kill_sub_scope_of_untracked_pid_is_noop() {
    let backend = RecordingBackend::new();
    let container = new_container("sh", &backend);
    container.kill_sub_scope_processes(fake_pids(1)[0]);
    assert_eq!(backend.scope_count(), 1);
}

#[test]
fn test_fallback_attach_on_v1_style_backend_uses_top_level() {
    let backend = RecordingBackend::new();
    let container = new_container("lua", &backend);
    let pid = fake_pids(1)[0];

    container.add_process(pid);
    assert_eq!(backend.procs("lua_container"), vec![pid.as_raw()]);
    assert!(!backend.exists("lua_container/shared"));
}
