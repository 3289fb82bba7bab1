//! Inference session management
//!
//! An [`InferenceSession`] is a handle to server-reserved decoding cache
//! capacity, keyed by the maximum sequence length reserved at creation. A
//! [`SessionManager`] holds the single active session for one model instance;
//! entering a [`SessionScope`] swaps the active slot and restores it when the
//! scope is dropped, on every exit path. Concurrent `generate` calls against
//! the same manager are the caller's responsibility to serialize; the slot
//! itself is internally synchronized.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Handle to a server-side cache reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceSession {
    id: Uuid,
    max_length: usize,
}

impl InferenceSession {
    pub fn new(id: Uuid, max_length: usize) -> Self {
        Self { id, max_length }
    }

    /// Unique session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Maximum sequence length reserved for this session
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

/// The remote-session collaborator: reserves and releases server-side
/// decoding caches.
pub trait SessionBackend: Send + Sync {
    /// Reserve an attention cache sized for `max_length` tokens
    fn create_session(&self, max_length: usize) -> Result<InferenceSession>;

    /// Release a reservation
    fn release_session(&self, session: &InferenceSession) -> Result<()>;
}

/// Create session request
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Maximal expected length of inference results; the server sizes the
    /// attention cache allocated to this client from it
    pub max_length: usize,
}

/// Create session response
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub max_length: usize,
}

/// Release session request
#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseSessionRequest {
    pub session_id: Uuid,
}

/// Per-model-instance active-session slot.
///
/// Explicit context passing instead of process-global state: two model
/// instances each own their manager and cannot share sessions by accident.
#[derive(Debug, Default)]
pub struct SessionManager {
    slot: Mutex<Option<InferenceSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently active session, if any
    pub fn active(&self) -> Option<InferenceSession> {
        self.slot.lock().clone()
    }

    fn swap(&self, next: Option<InferenceSession>) -> Option<InferenceSession> {
        std::mem::replace(&mut *self.slot.lock(), next)
    }

    /// Make `session` active for the duration of the returned scope. The
    /// previous active session is restored when the scope drops; the session
    /// itself stays alive (the caller owns its reservation).
    pub fn use_session<'a>(&'a self, session: InferenceSession) -> SessionScope<'a> {
        let previous = self.swap(Some(session));
        SessionScope {
            manager: self,
            previous,
            owned: None,
        }
    }

    /// Make `session` active and take ownership of its reservation: when the
    /// scope drops, the previous active session is restored and the
    /// reservation is released through `backend`.
    pub fn own_session<'a>(
        &'a self,
        session: InferenceSession,
        backend: &'a dyn SessionBackend,
    ) -> SessionScope<'a> {
        let previous = self.swap(Some(session.clone()));
        SessionScope {
            manager: self,
            previous,
            owned: Some((backend, session)),
        }
    }
}

/// Scoped session activation; restores the previous state on drop
/// (normal return, error propagation, or unwind).
pub struct SessionScope<'a> {
    manager: &'a SessionManager,
    previous: Option<InferenceSession>,
    owned: Option<(&'a dyn SessionBackend, InferenceSession)>,
}

impl SessionScope<'_> {
    /// The session this scope made active
    pub fn session(&self) -> Option<InferenceSession> {
        self.manager.active()
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        self.manager.swap(self.previous.take());
        if let Some((backend, session)) = self.owned.take() {
            tracing::info!(session_id = %session.id(), "releasing inference session");
            if let Err(err) = backend.release_session(&session) {
                // Reservation release is best-effort during unwinding; the
                // server reclaims expired sessions on its own.
                tracing::warn!(session_id = %session.id(), error = %err, "failed to release inference session");
            }
        }
    }
}
