use berth_core::{Agent, CoreError};
use berth_runtime::ExecRequest;
use berth_schema::ContainerId;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const DBUS_NAME: &str = "org.berth.Agent1";
pub const DBUS_INTERFACE: &str = "org.berth.Agent1";
pub const DBUS_PATH: &str = "/org/berth/Agent1";
pub const API_VERSION: u32 = 1;

fn to_fdo(msg: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(msg.to_string())
}

fn parse_id(id: &str) -> Result<ContainerId, zbus::fdo::Error> {
    id.parse()
        .map_err(|_| to_fdo(format!("invalid container id '{id}'")))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// The agent as seen over the bus.
///
/// Agent calls block on container locks and host tools, so each one runs on
/// the blocking pool. A fatal error is reported through `fatal` so that the
/// service loop can stop the agent.
pub struct AgentService {
    agent: Arc<Agent>,
    fatal: mpsc::UnboundedSender<String>,
}

impl AgentService {
    pub fn new(agent: Arc<Agent>, fatal: mpsc::UnboundedSender<String>) -> Self {
        Self { agent, fatal }
    }

    async fn call<T, F>(&self, method: &str, f: F) -> Result<T, zbus::fdo::Error>
    where
        F: FnOnce(&Agent) -> Result<T, CoreError> + Send + 'static,
        T: Send + 'static,
    {
        let agent = Arc::clone(&self.agent);
        let result = tokio::task::spawn_blocking(move || f(&agent))
            .await
            .map_err(to_fdo)?;
        result.map_err(|e| {
            error!("{method} failed: {e}");
            if e.is_fatal() {
                let _ = self.fatal.send(e.to_string());
            }
            to_fdo(e)
        })
    }
}

#[allow(clippy::unused_async)]
#[interface(name = "org.berth.Agent1")]
impl AgentService {
    #[zbus(property)]
    async fn api_version(&self) -> u32 {
        API_VERSION
    }

    async fn create(&self, config: String) -> Result<String, zbus::fdo::Error> {
        info!("D-Bus: Create");
        let id = self.call("Create", move |agent| agent.create(&config)).await?;
        Ok(id.to_string())
    }

    async fn bind_mount(
        &self,
        id: String,
        host_path: String,
        container_path: String,
        read_only: bool,
    ) -> Result<String, zbus::fdo::Error> {
        info!("D-Bus: BindMount {id} {host_path} -> {container_path} (ro={read_only})");
        let id = parse_id(&id)?;
        self.call("BindMount", move |agent| {
            agent.bind_mount(id, &host_path, &container_path, read_only)
        })
        .await
    }

    async fn set_capabilities(
        &self,
        id: String,
        capabilities: Vec<String>,
    ) -> Result<bool, zbus::fdo::Error> {
        info!("D-Bus: SetCapabilities {id} {capabilities:?}");
        let id = parse_id(&id)?;
        self.call("SetCapabilities", move |agent| {
            agent.set_capabilities(id, &capabilities)
        })
        .await?;
        Ok(true)
    }

    async fn set_gateway_configs(
        &self,
        id: String,
        configs: HashMap<String, String>,
    ) -> Result<(), zbus::fdo::Error> {
        info!("D-Bus: SetGatewayConfigs {id}");
        let id = parse_id(&id)?;
        let configs: BTreeMap<String, String> = configs.into_iter().collect();
        self.call("SetGatewayConfigs", move |agent| {
            agent.set_gateway_configs(id, &configs)
        })
        .await
    }

    async fn list_capabilities(&self) -> Vec<String> {
        info!("D-Bus: ListCapabilities");
        self.agent.list_capabilities()
    }

    async fn list(&self) -> Result<Vec<String>, zbus::fdo::Error> {
        info!("D-Bus: List");
        let ids = self.call("List", Agent::list).await?;
        Ok(ids.iter().map(ToString::to_string).collect())
    }

    /// Container state as JSON, for diagnostics.
    async fn inspect(&self, id: String) -> Result<String, zbus::fdo::Error> {
        info!("D-Bus: Inspect {id}");
        let id = parse_id(&id)?;
        let info = self.call("Inspect", move |agent| agent.inspect(id)).await?;
        serde_json::to_string(&info).map_err(to_fdo)
    }

    /// Returns the pid of the started process, or -1 if it could not be started.
    async fn execute(
        &self,
        id: String,
        command: String,
        cwd: String,
        stdout_path: String,
        env: HashMap<String, String>,
    ) -> i32 {
        info!("D-Bus: Execute {id} {command}");
        let Ok(id) = parse_id(&id) else {
            error!("Execute failed: invalid container id '{id}'");
            return -1;
        };
        let request = ExecRequest {
            command,
            cwd: non_empty(cwd),
            stdout: non_empty(stdout_path).map(PathBuf::from),
            env: env.into_iter().collect(),
        };
        match self
            .call("Execute", move |agent| agent.execute(id, request))
            .await
        {
            Ok(pid) => i32::try_from(pid).unwrap_or(-1),
            Err(_) => -1,
        }
    }

    async fn suspend(&self, id: String) -> Result<(), zbus::fdo::Error> {
        info!("D-Bus: Suspend {id}");
        let id = parse_id(&id)?;
        self.call("Suspend", move |agent| agent.suspend(id)).await
    }

    async fn resume(&self, id: String) -> Result<(), zbus::fdo::Error> {
        info!("D-Bus: Resume {id}");
        let id = parse_id(&id)?;
        self.call("Resume", move |agent| agent.resume(id)).await
    }

    async fn destroy(&self, id: String) -> Result<(), zbus::fdo::Error> {
        info!("D-Bus: Destroy {id}");
        let id = parse_id(&id)?;
        self.call("Destroy", move |agent| agent.destroy(id)).await
    }

    /// A process launched by `Execute` started or exited.
    #[zbus(signal)]
    pub async fn process_state_changed(
        emitter: &SignalEmitter<'_>,
        container_id: &str,
        pid: u32,
        running: bool,
        exit_code: i32,
    ) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::AgentConfig;
    use berth_gateway::HostEnvironment;
    use berth_runtime::{ContainerLayout, MockBackend};
    use std::fs;

    struct Setup {
        dir: tempfile::TempDir,
        backend: Arc<MockBackend>,
        service: AgentService,
        fatal: mpsc::UnboundedReceiver<String>,
    }

    fn setup_with_root(create_root: bool) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("containers");
        if create_root {
            fs::create_dir_all(&root).unwrap();
        }
        let manifests = dir.path().join("manifests");
        fs::create_dir_all(&manifests).unwrap();
        fs::write(
            manifests.join("test.json"),
            r#"{"capabilities": [
                {"name": "test.env", "gateways": [
                    {"id": "env", "config": [{"name": "FROM_CAP", "value": "1"}]}
                ]}
            ]}"#,
        )
        .unwrap();

        let backend = Arc::new(MockBackend::new(ContainerLayout::new(&root)));
        let config = AgentConfig {
            container_root: root,
            service_manifest_dir: manifests,
            default_service_manifest_dir: dir.path().join("defaults"),
            backend: "mock".to_owned(),
            ..AgentConfig::default()
        };
        let agent = Agent::with_backend(config, backend.clone(), HostEnvironment::default()).unwrap();
        let (tx, fatal) = mpsc::unbounded_channel();
        Setup {
            dir,
            backend,
            service: AgentService::new(Arc::new(agent), tx),
            fatal,
        }
    }

    fn setup() -> Setup {
        setup_with_root(true)
    }

    #[tokio::test]
    async fn create_list_destroy_roundtrip() {
        let s = setup();
        let a = s.service.create("[{}]".to_owned()).await.unwrap();
        let b = s.service.create("[{}]".to_owned()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(s.service.list().await.unwrap(), [a.clone(), b.clone()]);

        s.service.destroy(a.clone()).await.unwrap();
        assert_eq!(s.service.list().await.unwrap(), [b]);
        s.service.destroy(a).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_create_fails() {
        let s = setup();
        assert!(s.service.create(String::new()).await.is_err());
        assert!(s.service.create("[]".to_owned()).await.is_err());
        assert!(s.service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_ids_fail() {
        let s = setup();
        assert!(s.service.destroy("SC-1".to_owned()).await.is_err());
        assert!(s.service.suspend("abc".to_owned()).await.is_err());
        assert_eq!(
            s.service
                .execute(
                    "x".to_owned(),
                    "true".to_owned(),
                    String::new(),
                    String::new(),
                    HashMap::new()
                )
                .await,
            -1
        );
    }

    #[tokio::test]
    async fn unknown_capability_is_failed_and_service_survives() {
        let s = setup();
        let id = s.service.create("[{}]".to_owned()).await.unwrap();
        let err = s
            .service
            .set_capabilities(id.clone(), vec!["does.not.exist".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));

        assert_eq!(s.service.list_capabilities().await, ["test.env"]);
        assert!(s
            .service
            .set_capabilities(id, vec!["test.env".to_owned()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn execute_passes_environment() {
        let s = setup();
        let id = s.service.create("[{}]".to_owned()).await.unwrap();
        s.service
            .set_gateway_configs(
                id.clone(),
                HashMap::from([(
                    "env".to_owned(),
                    r#"[{"name": "X", "value": "1234"}]"#.to_owned(),
                )]),
            )
            .await
            .unwrap();

        let out = s.dir.path().join("env.txt");
        let pid = s
            .service
            .execute(
                id,
                "env".to_owned(),
                "/".to_owned(),
                out.to_string_lossy().into_owned(),
                HashMap::from([("Y".to_owned(), "5".to_owned())]),
            )
            .await;
        assert!(pid > 0);
        let dumped = fs::read_to_string(out).unwrap();
        assert!(dumped.lines().any(|l| l == "X=1234"));
        assert!(dumped.lines().any(|l| l == "Y=5"));
    }

    #[tokio::test]
    async fn execute_failure_returns_minus_one() {
        let s = setup();
        let id = s.service.create("[{}]".to_owned()).await.unwrap();
        s.backend.fail_operation("attach");
        let pid = s
            .service
            .execute(id, "true".to_owned(), String::new(), String::new(), HashMap::new())
            .await;
        assert_eq!(pid, -1);
    }

    #[tokio::test]
    async fn suspend_resume_and_inspect() {
        let s = setup();
        let id = s.service.create("[{}]".to_owned()).await.unwrap();
        s.service
            .execute(id.clone(), "true".to_owned(), String::new(), String::new(), HashMap::new())
            .await;
        s.service.suspend(id.clone()).await.unwrap();
        assert!(s.service.suspend(id.clone()).await.is_err());

        let info: serde_json::Value =
            serde_json::from_str(&s.service.inspect(id.clone()).await.unwrap()).unwrap();
        assert_eq!(info["state"], "suspended");

        s.service.resume(id).await.unwrap();
    }

    #[tokio::test]
    async fn bind_mount_returns_container_path() {
        let s = setup();
        let id = s.service.create("[{}]".to_owned()).await.unwrap();
        let host = s.dir.path().to_string_lossy().into_owned();
        let mounted = s
            .service
            .bind_mount(id, host, "/data/../srv".to_owned(), true)
            .await
            .unwrap();
        assert_eq!(mounted, "/srv");
    }

    #[tokio::test]
    async fn missing_root_reports_fatal() {
        let mut s = setup_with_root(false);
        assert!(s.service.create("[{}]".to_owned()).await.is_err());
        assert!(s.fatal.try_recv().is_ok());
    }

    #[tokio::test]
    async fn ordinary_failures_are_not_fatal() {
        let mut s = setup();
        assert!(s.service.create("nope".to_owned()).await.is_err());
        assert!(s.fatal.try_recv().is_err());
    }
}
