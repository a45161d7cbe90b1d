use crate::container::Container;
use crate::{poisoned, CoreError};
use berth_schema::ContainerId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

/// Live containers of one agent.
///
/// The map itself sits behind a read-write lock that is only held long enough
/// to look up, insert or remove an entry. Each container has its own mutex,
/// held for the whole of a state-changing call, so calls on different
/// containers proceed in parallel and calls on the same container serialize.
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    containers: BTreeMap<ContainerId, Arc<Mutex<Container>>>,
    next_id: u32,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next id whose OS-level name is not taken.
    ///
    /// Ids increase monotonically for the life of the registry, so an id is
    /// never handed out twice even after its container is gone.
    pub fn reserve_id(
        &self,
        mut is_taken: impl FnMut(ContainerId) -> bool,
    ) -> Result<ContainerId, CoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        loop {
            let candidate = ContainerId(inner.next_id);
            inner.next_id = inner.next_id.checked_add(1).ok_or(CoreError::IdsExhausted)?;
            if !inner.containers.contains_key(&candidate) && !is_taken(candidate) {
                return Ok(candidate);
            }
        }
    }

    pub fn insert(&self, container: Container) -> Result<Arc<Mutex<Container>>, CoreError> {
        let id = container.id;
        let entry = Arc::new(Mutex::new(container));
        self.inner
            .write()
            .map_err(poisoned)?
            .containers
            .insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, id: ContainerId) -> Result<Arc<Mutex<Container>>, CoreError> {
        self.find(id)?.ok_or(CoreError::ContainerNotFound(id))
    }

    pub fn find(&self, id: ContainerId) -> Result<Option<Arc<Mutex<Container>>>, CoreError> {
        Ok(self
            .inner
            .read()
            .map_err(poisoned)?
            .containers
            .get(&id)
            .cloned())
    }

    pub fn remove(&self, id: ContainerId) -> Result<Option<Arc<Mutex<Container>>>, CoreError> {
        Ok(self.inner.write().map_err(poisoned)?.containers.remove(&id))
    }

    /// Snapshot of the registered ids.
    pub fn ids(&self) -> Result<Vec<ContainerId>, CoreError> {
        Ok(self
            .inner
            .read()
            .map_err(poisoned)?
            .containers
            .keys()
            .copied()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.containers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
