//! Startup after a crash: containers left behind by a dead agent.

use berth_core::{Agent, AgentConfig, CoreError};
use berth_gateway::HostEnvironment;
use berth_runtime::{ContainerBackend, ContainerLayout, MockBackend};
use berth_schema::ContainerName;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn config_for(dir: &Path) -> AgentConfig {
    AgentConfig {
        container_root: dir.join("containers"),
        service_manifest_dir: dir.join("manifests"),
        default_service_manifest_dir: dir.join("defaults"),
        backend: "mock".to_owned(),
        ..AgentConfig::default()
    }
}

fn names(backend: &MockBackend) -> Vec<String> {
    backend
        .list()
        .unwrap()
        .into_iter()
        .map(ContainerName::into_inner)
        .collect()
}

#[test]
fn orphans_destroyed_and_foreign_containers_kept() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    fs::create_dir_all(&config.container_root).unwrap();
    let backend = Arc::new(MockBackend::new(ContainerLayout::new(&config.container_root)));
    backend.seed_container("SC-7");
    backend.seed_container("other-1");
    fs::create_dir_all(config.container_root.join("SC-7/gateways")).unwrap();

    let agent = Agent::with_backend(config.clone(), backend.clone(), HostEnvironment::default()).unwrap();

    assert_eq!(names(&backend), ["other-1"]);
    assert!(!config.container_root.join("SC-7").exists());
    assert!(agent.list().unwrap().is_empty());
}

#[test]
fn custom_prefix_scopes_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(dir.path());
    config.container_prefix = "app-".to_owned();
    fs::create_dir_all(&config.container_root).unwrap();
    let backend = Arc::new(MockBackend::new(ContainerLayout::new(&config.container_root)));
    backend.seed_container("SC-3");
    backend.seed_container("app-3");

    let agent = Agent::with_backend(config, backend.clone(), HostEnvironment::default()).unwrap();
    assert_eq!(names(&backend), ["SC-3"]);

    let id = agent.create("[{}]").unwrap();
    assert!(names(&backend).contains(&format!("app-{id}")));
}

#[test]
fn undestroyable_orphan_name_is_not_reused() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    fs::create_dir_all(&config.container_root).unwrap();
    let backend = Arc::new(MockBackend::new(ContainerLayout::new(&config.container_root)));
    backend.seed_container("SC-1");
    backend.fail_operation("destroy");

    let agent = Agent::with_backend(config, backend.clone(), HostEnvironment::default()).unwrap();
    assert_eq!(names(&backend), ["SC-1"]);

    let id = agent.create("[{}]").unwrap();
    assert_ne!(format!("SC-{id}"), "SC-1");
}

#[test]
fn restarted_agent_cleans_up_after_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path());
    fs::create_dir_all(&config.container_root).unwrap();
    let backend = Arc::new(MockBackend::new(ContainerLayout::new(&config.container_root)));

    let first = Agent::with_backend(config.clone(), backend.clone(), HostEnvironment::default()).unwrap();
    first.create("[{}]").unwrap();
    first.create("[{}]").unwrap();
    assert_eq!(names(&backend).len(), 2);

    // While the first agent is alive the root is taken.
    assert!(matches!(
        Agent::with_backend(config.clone(), backend.clone(), HostEnvironment::default()),
        Err(CoreError::AgentLocked(_))
    ));

    // Simulate a crash: the agent goes away without destroying anything.
    drop(first);
    let second = Agent::with_backend(config, backend.clone(), HostEnvironment::default()).unwrap();
    assert!(names(&backend).is_empty());
    assert!(second.list().unwrap().is_empty());
}
