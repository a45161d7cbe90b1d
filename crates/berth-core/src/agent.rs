use crate::capability::CapabilityRegistry;
use crate::concurrency::AgentLock;
use crate::config::AgentConfig;
use crate::container::{Container, ContainerInfo};
use crate::lifecycle::{invalid_transition, validate_transition, ContainerState};
use crate::process::{self, ProcessListener};
use crate::reconcile::destroy_orphans;
use crate::registry::ContainerRegistry;
use crate::{poisoned, CoreError};
use berth_gateway::{GatewayPolicy, HostEnvironment};
use berth_runtime::{
    select_backend, ContainerBackend, ContainerSpec, ExecRequest, MountPolicy, RuntimeError,
};
use berth_schema::{parse_container_options, CapabilityName, ContainerId, ContainerName, GatewayId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// The container agent behind the RPC surface.
///
/// Owns the container and capability registries and the backend. Every public
/// method is safe to call from several threads at once.
pub struct Agent {
    config: AgentConfig,
    backend: Arc<dyn ContainerBackend>,
    capabilities: CapabilityRegistry,
    containers: ContainerRegistry,
    host: HostEnvironment,
    policy: GatewayPolicy,
    listener: RwLock<Option<ProcessListener>>,
    lock: Option<AgentLock>,
}

impl Agent {
    /// Start an agent with the backend named in `config` and the current
    /// process environment.
    pub fn new(config: AgentConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let backend = select_backend(&config.backend, config.layout(), config.lxc_settings())?;
        Self::with_backend(config, Arc::from(backend), HostEnvironment::capture())
    }

    /// Start an agent on an explicit backend.
    ///
    /// Takes the agent lock on the container root, loads all service
    /// manifests and destroys containers left over from a previous run.
    pub fn with_backend(
        config: AgentConfig,
        backend: Arc<dyn ContainerBackend>,
        host: HostEnvironment,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = backend.layout();
        let lock = if layout.root().is_dir() {
            Some(AgentLock::try_acquire(&layout.lock_file())?)
        } else {
            warn!(
                "container root {} does not exist; containers cannot be created",
                layout.root().display()
            );
            None
        };

        let capabilities = CapabilityRegistry::load(
            &config.service_manifest_dir,
            &config.default_service_manifest_dir,
        )?;

        match destroy_orphans(
            backend.as_ref(),
            &config.container_prefix,
            config.shutdown_timeout(),
        ) {
            Ok(orphans) if !orphans.is_empty() => {
                info!("reconciled {} orphaned container(s)", orphans.len());
            }
            Ok(_) => debug!("no orphaned containers"),
            Err(e) => warn!("could not scan for orphaned containers: {e}"),
        }

        info!("agent ready on {} backend", backend.name());
        Ok(Self {
            policy: config.gateway_policy(),
            config,
            backend,
            capabilities,
            containers: ContainerRegistry::new(),
            host,
            listener: RwLock::new(None),
            lock,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ContainerBackend {
        self.backend.as_ref()
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Receive an event whenever a launched process starts or exits.
    pub fn set_process_listener(&self, listener: ProcessListener) -> Result<(), CoreError> {
        *self.listener.write().map_err(poisoned)? = Some(listener);
        Ok(())
    }

    pub fn create(&self, config: &str) -> Result<ContainerId, CoreError> {
        let options = parse_container_options(config)?;
        self.backend.layout().ensure_root()?;

        let existing: BTreeSet<ContainerName> = self.backend.list()?.into_iter().collect();
        let prefix = self.config.container_prefix.as_str();
        let id = self
            .containers
            .reserve_id(|id| existing.contains(&ContainerName::for_id(prefix, id)))?;
        let name = ContainerName::for_id(prefix, id);

        if let Err(e) = self.backend.create(&ContainerSpec {
            name: name.clone(),
            options,
        }) {
            // Whatever the backend allocated before failing must not outlive the call.
            // A name that already existed belongs to someone else.
            if matches!(e, RuntimeError::AlreadyExists(_)) {
                return Err(e.into());
            }
            if let Err(cleanup) = self
                .backend
                .destroy(name.as_str(), self.config.shutdown_timeout())
            {
                warn!("cleanup after failed create of {name} failed: {cleanup}");
            }
            return Err(e.into());
        }
        self.containers.insert(Container::new(id, name.clone(), options))?;
        info!("created container {name}");
        Ok(id)
    }

    /// Make a host path visible in the container. Returns the canonical
    /// container path. Repeating an identical mount is a no-op.
    pub fn bind_mount(
        &self,
        id: ContainerId,
        host_path: &str,
        container_path: &str,
        read_only: bool,
    ) -> Result<String, CoreError> {
        let entry = self.containers.get(id)?;
        let mut container = entry.lock().map_err(poisoned)?;
        ensure_live(&container)?;

        let mount = MountPolicy::default().validate(host_path, container_path, read_only)?;
        let target = mount.target.to_string_lossy().into_owned();
        if let Some(existing) = container.bind_mounts.get(&mount.target) {
            if existing.source == mount.source && existing.read_only == mount.read_only {
                debug!("{target} already mounted in {}", container.name);
                return Ok(target);
            }
            return Err(CoreError::MountConflict {
                target,
                existing: existing.source.display().to_string(),
            });
        }

        self.backend.bind_mount(container.name.as_str(), &mount)?;
        info!(
            "mounted {} at {target} in {} (read-only: {read_only})",
            mount.source.display(),
            container.name
        );
        container.bind_mounts.insert(mount.target.clone(), mount);
        Ok(target)
    }

    /// Apply the named capabilities, plus the default ones on first use.
    ///
    /// Unknown names fail before any gateway is touched.
    pub fn set_capabilities(&self, id: ContainerId, names: &[String]) -> Result<(), CoreError> {
        let names: Vec<CapabilityName> = names.iter().map(CapabilityName::new).collect();
        let entry = self.containers.get(id)?;
        let mut container = entry.lock().map_err(poisoned)?;
        ensure_live(&container)?;

        let include_defaults = !container.defaults_applied;
        let fragments = self.capabilities.resolve(&names, include_defaults)?;
        let result = self.configure(&mut container, &fragments);
        if include_defaults && merged(&result) {
            container.defaults_applied = true;
        }
        result?;
        info!("{}: capabilities set: {}", container.name, join(&names));
        Ok(())
    }

    /// Push raw gateway configurations, bypassing capabilities.
    pub fn set_gateway_configs(
        &self,
        id: ContainerId,
        configs: &BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        let mut fragments = Vec::with_capacity(configs.len());
        for (gateway, raw) in configs {
            let gateway_id: GatewayId = gateway
                .parse()
                .map_err(|_| CoreError::UnknownGateway(gateway.clone()))?;
            let value: serde_json::Value =
                serde_json::from_str(raw).map_err(|e| CoreError::InvalidGatewayConfig {
                    gateway: gateway.clone(),
                    reason: e.to_string(),
                })?;
            if !value.is_array() {
                return Err(CoreError::InvalidGatewayConfig {
                    gateway: gateway.clone(),
                    reason: "configuration must be a JSON array".to_owned(),
                });
            }
            fragments.push((gateway_id, value));
        }

        let entry = self.containers.get(id)?;
        let mut container = entry.lock().map_err(poisoned)?;
        ensure_live(&container)?;
        self.configure(&mut container, &fragments)
    }

    pub fn list_capabilities(&self) -> Vec<String> {
        self.capabilities
            .standard_names()
            .into_iter()
            .map(CapabilityName::into_inner)
            .collect()
    }

    pub fn list(&self) -> Result<Vec<ContainerId>, CoreError> {
        self.containers.ids()
    }

    pub fn inspect(&self, id: ContainerId) -> Result<ContainerInfo, CoreError> {
        let entry = self.containers.get(id)?;
        let container = entry.lock().map_err(poisoned)?;
        Ok(container.info())
    }

    /// Start a process in the container and return its pid without waiting
    /// for it. Its exit is reported to the process listener.
    ///
    /// Gateway variables are passed to the process; variables in the request
    /// override them.
    pub fn execute(&self, id: ContainerId, request: ExecRequest) -> Result<u32, CoreError> {
        let entry = self.containers.get(id)?;
        let mut container = entry.lock().map_err(poisoned)?;
        match container.state {
            ContainerState::Created | ContainerState::Configuring | ContainerState::Running => {}
            other => return Err(invalid_transition(other, ContainerState::Running)),
        }
        self.ensure_defaults(&mut container)?;

        let mut env = container.env.clone();
        env.extend(request.env);
        let request = ExecRequest { env, ..request };
        let spawned = self.backend.attach(container.name.as_str(), &request)?;
        let pid = spawned.pid;

        if container.state != ContainerState::Running {
            validate_transition(container.state, ContainerState::Running)?;
            container.state = ContainerState::Running;
        }
        container.processes.insert(pid);
        info!("{}: started pid {pid}: {}", container.name, request.command);
        drop(container);

        let listener = self.listener.read().map_err(poisoned)?.clone();
        process::watch(spawned, id, Arc::downgrade(&entry), listener);
        Ok(pid)
    }

    pub fn suspend(&self, id: ContainerId) -> Result<(), CoreError> {
        let entry = self.containers.get(id)?;
        let mut container = entry.lock().map_err(poisoned)?;
        validate_transition(container.state, ContainerState::Suspended)?;
        self.backend.freeze(container.name.as_str())?;
        container.state = ContainerState::Suspended;
        info!("suspended {}", container.name);
        Ok(())
    }

    pub fn resume(&self, id: ContainerId) -> Result<(), CoreError> {
        let entry = self.containers.get(id)?;
        let mut container = entry.lock().map_err(poisoned)?;
        if container.state != ContainerState::Suspended {
            return Err(invalid_transition(container.state, ContainerState::Running));
        }
        self.backend.unfreeze(container.name.as_str())?;
        container.state = ContainerState::Running;
        info!("resumed {}", container.name);
        Ok(())
    }

    /// Tear the container down and forget it. Unknown and already destroyed
    /// ids succeed without doing anything.
    pub fn destroy(&self, id: ContainerId) -> Result<(), CoreError> {
        let Some(entry) = self.containers.find(id)? else {
            debug!("destroy: container {id} is not registered");
            return Ok(());
        };
        let mut container = entry.lock().map_err(poisoned)?;
        if container.state != ContainerState::Destroyed {
            self.teardown(&mut container)?;
        }
        // Still under the container lock, so List never sees a destroyed id.
        self.containers.remove(id)?;
        Ok(())
    }

    /// Destroy every container, unless configured to leave them running.
    /// All containers are attempted; the first error is returned.
    pub fn shutdown(&self) -> Result<(), CoreError> {
        let ids = self.containers.ids()?;
        if self.config.keep_containers_alive {
            info!("shutdown: leaving {} container(s) running", ids.len());
            return Ok(());
        }
        info!("shutdown: destroying {} container(s)", ids.len());
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.destroy(id) {
                error!("shutdown: failed to destroy container {id}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn configure(
        &self,
        container: &mut Container,
        fragments: &[(GatewayId, serde_json::Value)],
    ) -> Result<(), CoreError> {
        let previous = container.state;
        validate_transition(previous, ContainerState::Configuring)?;
        container.state = ContainerState::Configuring;
        let result =
            container.apply_fragments(self.backend.as_ref(), &self.host, &self.policy, fragments);
        if previous == ContainerState::Running {
            container.state = ContainerState::Running;
        }
        result.map_err(|e| {
            error!("{}: configuration failed: {e}", container.name);
            CoreError::Gateway(e)
        })
    }

    fn ensure_defaults(&self, container: &mut Container) -> Result<(), CoreError> {
        if container.defaults_applied {
            return Ok(());
        }
        if !self.capabilities.has_defaults() {
            container.defaults_applied = true;
            return Ok(());
        }
        let fragments = self.capabilities.resolve(&[], true)?;
        let result = container
            .apply_fragments(self.backend.as_ref(), &self.host, &self.policy, &fragments)
            .map_err(CoreError::Gateway);
        if merged(&result) {
            container.defaults_applied = true;
        }
        debug!("{}: default capabilities applied", container.name);
        result
    }

    fn teardown(&self, container: &mut Container) -> Result<(), CoreError> {
        for e in container.teardown_gateways(self.backend.as_ref(), &self.host) {
            debug!("{}: ignoring gateway teardown error: {e}", container.name);
        }
        if container.state == ContainerState::Suspended {
            if let Err(e) = self.backend.unfreeze(container.name.as_str()) {
                warn!("{}: unfreeze before destroy failed: {e}", container.name);
            }
        }
        self.backend
            .destroy(container.name.as_str(), self.config.shutdown_timeout())?;
        container.processes.clear();
        container.bind_mounts.clear();
        container.state = ContainerState::Destroyed;
        info!("destroyed container {}", container.name);
        Ok(())
    }
}

/// Destroyed containers linger in the registry only while a destroy is in
/// flight; to callers they no longer exist.
fn ensure_live(container: &Container) -> Result<(), CoreError> {
    if container.state == ContainerState::Destroyed {
        Err(CoreError::ContainerNotFound(container.id))
    } else {
        Ok(())
    }
}

/// Whether the gateways took the fragments in, even if activation then failed.
fn merged(result: &Result<(), CoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(CoreError::Gateway(e)) => e.is_activation(),
        Err(_) => false,
    }
}

fn join(names: &[CapabilityName]) -> String {
    names
        .iter()
        .map(CapabilityName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
