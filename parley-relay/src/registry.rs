//! Client registry for the relay server.
//!
//! Maps each participant identity to the handle of the session that holds it.
//! A successful [`ClientRegistry::register`] returns a [`Registration`] guard;
//! dropping or releasing the guard removes the entry again, but only while it
//! still belongs to the same session. A newer session that replaced it under
//! [`DuplicatePolicy::Replace`] is left alone.
//!
//! Entries are ephemeral and lost on relay restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::{SessionHandle, SessionId, SessionState};

/// What to do when a second session claims an identity already in use.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Refuse the newcomer; the existing session keeps the identity.
    #[default]
    Reject,
    /// Evict the existing session in favour of the newcomer.
    Replace,
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Another live session already holds this identity.
    #[error("identity '{0}' is already connected")]
    DuplicateIdentity(String),
}

type ClientMap = BTreeMap<String, SessionHandle>;

/// Directory of active sessions keyed by identity.
///
/// Safe to share across tasks. Iteration order, and therefore
/// [`snapshot`](Self::snapshot), is sorted by identity.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<ClientMap>>,
    policy: DuplicatePolicy,
}

impl ClientRegistry {
    /// Creates an empty registry with the given duplicate policy.
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            policy,
        }
    }

    /// Returns the duplicate policy in effect.
    #[must_use]
    pub const fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Registers a session under its identity and marks it active.
    ///
    /// Under [`DuplicatePolicy::Replace`] a previous holder of the identity is
    /// removed and returned through [`Registration::take_evicted`]; the caller
    /// is responsible for closing it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateIdentity`] under
    /// [`DuplicatePolicy::Reject`] if the identity is taken.
    pub fn register(&self, handle: SessionHandle) -> Result<Registration, RegistryError> {
        let identity = handle.identity().to_string();
        let id = handle.id();

        let evicted = {
            let mut clients = self.clients.write();
            if self.policy == DuplicatePolicy::Reject && clients.contains_key(&identity) {
                return Err(RegistryError::DuplicateIdentity(identity));
            }
            handle.advance(SessionState::Active);
            clients.insert(identity.clone(), handle)
        };

        Ok(Registration {
            clients: Arc::clone(&self.clients),
            identity,
            id,
            evicted,
            released: false,
        })
    }

    /// Removes `identity` if it is still held by session `id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn unregister(&self, identity: &str, id: SessionId) -> bool {
        remove_if_owned(&self.clients, identity, id)
    }

    /// Returns the handle registered under `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<SessionHandle> {
        self.clients.read().get(identity).cloned()
    }

    /// Returns the sorted list of registered identities.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    /// Returns handles for every registered session.
    #[must_use]
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.clients.read().values().cloned().collect()
    }

    /// Returns handles for every registered session except `id`.
    #[must_use]
    pub fn others(&self, id: SessionId) -> Vec<SessionHandle> {
        self.clients
            .read()
            .values()
            .filter(|handle| handle.id() != id)
            .cloned()
            .collect()
    }

    /// Returns the number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Returns `true` if nobody is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

fn remove_if_owned(clients: &RwLock<ClientMap>, identity: &str, id: SessionId) -> bool {
    let mut clients = clients.write();
    if clients.get(identity).is_some_and(|handle| handle.id() == id) {
        clients.remove(identity);
        true
    } else {
        false
    }
}

/// Proof that a session holds its identity in the registry.
///
/// The entry is removed when the guard is released or dropped.
#[derive(Debug)]
pub struct Registration {
    clients: Arc<RwLock<ClientMap>>,
    identity: String,
    id: SessionId,
    evicted: Option<SessionHandle>,
    released: bool,
}

impl Registration {
    /// Returns the registered identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the id of the registered session.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Takes the session this registration displaced, if any.
    pub fn take_evicted(&mut self) -> Option<SessionHandle> {
        self.evicted.take()
    }

    /// Removes the registry entry now.
    ///
    /// Returns `false` if the entry had already been taken over by a newer
    /// session.
    pub fn release(mut self) -> bool {
        self.released = true;
        remove_if_owned(&self.clients, &self.identity, self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            remove_if_owned(&self.clients, &self.identity, self.id);
        }
    }
}
