//! Published roots and object leases

use crate::lock;
use crate::object::Exposed;
use crate::policy::{AccessPolicy, Allowed};
use crate::types::TypeUniverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Binding of a remote id to an exposed object and the policy guarding it
pub struct Lease {
    /// Id handed to peers
    pub id: i32,
    /// Leased object
    pub object: Exposed,
    /// Policy checked on every member access
    pub policy: Arc<dyn AccessPolicy>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    /// Published roots by name
    roots: HashMap<String, Exposed>,
    /// Leases by id
    leases: HashMap<i32, Arc<Lease>>,
    /// Lease ids by object identity
    identities: HashMap<usize, i32>,
    /// Last allocated id, never reused
    last_id: i32,
}

/// Objects visible to peers.
///
/// Holds the named roots and one lease per object that has ever been handed
/// out. Leases are only dropped through [`Registry::release`]; without it the
/// registry grows for as long as it lives.
pub struct Registry {
    state: Mutex<RegistryState>,
    universe: Arc<TypeUniverse>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Registry")
            .field("roots", &state.roots.len())
            .field("leases", &state.leases.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_universe(Arc::new(TypeUniverse::new()))
    }

    /// Create an empty registry recording exposed types in `universe`
    pub fn with_universe(universe: Arc<TypeUniverse>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            universe,
        }
    }

    /// Types known to this registry
    pub fn universe(&self) -> &Arc<TypeUniverse> {
        &self.universe
    }

    /// Publish an object under a name, replacing any previous root
    pub fn add_object(&self, name: impl Into<String>, object: Exposed) {
        let name = name.into();
        self.universe.register_descriptor(object.descriptor());
        info!(name = %name, class = %object.class().name(), "Publishing object");
        lock(&self.state).roots.insert(name, object);
    }

    /// Withdraw a root.
    ///
    /// Existing leases of the object stay valid.
    pub fn remove_object(&self, name: &str) -> Option<Exposed> {
        let removed = lock(&self.state).roots.remove(name);
        if removed.is_some() {
            info!(name, "Withdrew object");
        }
        removed
    }

    /// Names of the published roots
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).roots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Root published under `name`, without leasing it
    pub fn root(&self, name: &str) -> Option<Exposed> {
        lock(&self.state).roots.get(name).cloned()
    }

    /// Lease of the root published under `name`
    pub fn try_resolve_by_name(&self, name: &str) -> Option<Arc<Lease>> {
        let object = self.root(name)?;
        Some(self.try_resolve_by_identity(&object))
    }

    /// Lease with the given id
    pub fn try_resolve_by_id(&self, id: i32) -> Option<Arc<Lease>> {
        lock(&self.state).leases.get(&id).cloned()
    }

    /// Lease of an object, created with [`Allowed`] when it has none yet
    pub fn try_resolve_by_identity(&self, object: &Exposed) -> Arc<Lease> {
        self.register(object, Allowed::shared())
    }

    /// Lease of an object, created with `policy` when it has none yet.
    ///
    /// An object keeps the policy of its first lease.
    pub fn register(&self, object: &Exposed, policy: Arc<dyn AccessPolicy>) -> Arc<Lease> {
        self.lease_entry(object, policy).0
    }

    /// Id of the object's lease, created with `policy` when needed
    pub fn lease_with(&self, object: &Exposed, policy: Arc<dyn AccessPolicy>) -> i32 {
        self.register(object, policy).id
    }

    /// Lease of an object and whether this call created it
    pub(crate) fn lease_entry(
        &self,
        object: &Exposed,
        policy: Arc<dyn AccessPolicy>,
    ) -> (Arc<Lease>, bool) {
        let mut state = lock(&self.state);

        if let Some(lease) = state
            .identities
            .get(&object.identity())
            .and_then(|id| state.leases.get(id))
        {
            return (Arc::clone(lease), false);
        }

        state.last_id += 1;
        let lease = Arc::new(Lease {
            id: state.last_id,
            object: object.clone(),
            policy,
        });
        state.identities.insert(object.identity(), lease.id);
        state.leases.insert(lease.id, Arc::clone(&lease));
        drop(state);

        self.universe.register_descriptor(object.descriptor());
        debug!(id = lease.id, class = %object.class().name(), "Created lease");
        (lease, true)
    }

    /// Drop a lease; its id is never handed out again
    pub fn release(&self, id: i32) -> bool {
        let mut state = lock(&self.state);
        match state.leases.remove(&id) {
            Some(lease) => {
                state.identities.remove(&lease.object.identity());
                debug!(id, "Released lease");
                true
            }
            None => false,
        }
    }

    /// Number of live leases
    pub fn len(&self) -> usize {
        lock(&self.state).leases.len()
    }

    /// Whether no leases exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
