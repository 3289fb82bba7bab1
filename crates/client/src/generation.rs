//! Generation orchestration
//!
//! [`GenerationController`] wraps one autoregressive decoding call with
//! session management: it decides whether to use an explicitly supplied
//! session, transparently reuse the already-active one, or reserve a new one
//! sized from the sizing options, and it guarantees the reservation is
//! released on every exit path. The decoding itself is performed by an
//! external [`GenerationAlgorithm`], which receives a [`CacheReorder`] hook
//! to call once per beam-search step.

use crate::error::{ClientError, Result};
use crate::session::{InferenceSession, SessionBackend, SessionManager, SessionScope};

/// Keyword parameters for one generation call
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Total maximum sequence length, prompt included
    pub max_length: Option<usize>,
    /// Maximum number of newly generated tokens
    pub max_new_tokens: Option<usize>,
}

/// Server-side decoding cache state carried between generation steps.
///
/// Immutable value object: reordering produces a new instance, the original
/// is left untouched (other references to it may still be in flight).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PastKeyValues {
    hypo_ids: Option<Vec<u32>>,
}

impl PastKeyValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordering permutation over beam-search hypotheses, if any
    pub fn hypo_ids(&self) -> Option<&[u32]> {
        self.hypo_ids.as_deref()
    }

    /// Functional update: a new cache state with `hypo_ids` replaced
    pub fn reordered(&self, beam_idx: &[u32]) -> Self {
        Self {
            hypo_ids: Some(beam_idx.to_vec()),
        }
    }
}

/// Cache-reordering hook handed to the generation collaborator; invoked once
/// per beam-search step with the surviving hypothesis indices.
pub trait CacheReorder {
    fn reorder_cache(&self, past: &PastKeyValues, beam_idx: &[u32]) -> PastKeyValues;
}

/// The generation-control collaborator: an external decoding algorithm
/// invoked once per generation call.
pub trait GenerationAlgorithm {
    fn run(
        &self,
        inputs: Option<&[u32]>,
        options: &GenerateOptions,
        reorder: &dyn CacheReorder,
    ) -> Result<Vec<u32>>;
}

/// Orchestrates generation calls against a session backend.
///
/// Holds the per-model-instance [`SessionManager`]; two controllers never
/// share active-session state.
pub struct GenerationController<B: SessionBackend> {
    backend: B,
    sessions: SessionManager,
}

impl<B: SessionBackend> GenerationController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            sessions: SessionManager::new(),
        }
    }

    /// The active-session slot for this model instance
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Explicitly reserve a session for `max_length` tokens. The caller owns
    /// the reservation and may pass the handle to [`Self::generate`].
    pub fn create_session(&self, max_length: usize) -> Result<InferenceSession> {
        let session = self.backend.create_session(max_length)?;
        tracing::info!(session_id = %session.id(), max_length, "created inference session");
        Ok(session)
    }

    /// Run one autoregressive generation call.
    ///
    /// Session choice, in order:
    /// 1. `session` supplied: it becomes the active session for the duration
    ///    of the call; the caller keeps its reservation.
    /// 2. A session is already active: reuse it transparently.
    /// 3. Otherwise: reserve a new session sized from `options` (exactly one
    ///    of `max_length` / `max_new_tokens` must be set, checked before any
    ///    server resource is reserved) and release it when the call exits.
    pub fn generate<G: GenerationAlgorithm>(
        &self,
        algorithm: &G,
        inputs: Option<&[u32]>,
        session: Option<InferenceSession>,
        options: &GenerateOptions,
    ) -> Result<Vec<u32>> {
        let _scope: Option<SessionScope<'_>> = match session {
            Some(session) => Some(self.sessions.use_session(session)),
            None if self.sessions.active().is_some() => None,
            None => {
                let max_length = reserved_length(inputs, options)?;
                let created = self.backend.create_session(max_length)?;
                tracing::info!(session_id = %created.id(), max_length, "opened inference session");
                Some(self.sessions.own_session(created, &self.backend))
            }
        };

        algorithm.run(inputs, options, self)
    }
}

impl<B: SessionBackend> CacheReorder for GenerationController<B> {
    fn reorder_cache(&self, past: &PastKeyValues, beam_idx: &[u32]) -> PastKeyValues {
        past.reordered(beam_idx)
    }
}

/// Cache capacity to reserve for a fresh session.
///
/// Fails fast when both or neither sizing parameter is given.
fn reserved_length(inputs: Option<&[u32]>, options: &GenerateOptions) -> Result<usize> {
    match (options.max_length, options.max_new_tokens) {
        (Some(_), Some(_)) | (None, None) => Err(ClientError::SessionSizing),
        (Some(max_length), None) => Ok(max_length),
        (None, Some(max_new_tokens)) => {
            Ok(inputs.map_or(0, |tokens| tokens.len()) + max_new_tokens)
        }
    }
}
