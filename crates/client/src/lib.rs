//! swarmlm client - inference sessions and generation orchestration
//!
//! A native Rust client layer for stateful autoregressive decoding against a
//! swarm of inference servers. It manages server-side cache reservations
//! ([`InferenceSession`]), the per-model-instance active-session slot
//! ([`SessionManager`]), and wraps each generation call so that reservations
//! never leak across calls ([`GenerationController`]).
//!
//! # Example
//!
//! ```no_run
//! use swarmlm_client::{GenerateOptions, GenerationController, HttpSessionBackend};
//! # use swarmlm_client::{CacheReorder, GenerationAlgorithm, Result};
//! # struct GreedyDecoder;
//! # impl GenerationAlgorithm for GreedyDecoder {
//! #     fn run(&self, _i: Option<&[u32]>, _o: &GenerateOptions, _r: &dyn CacheReorder) -> Result<Vec<u32>> {
//! #         Ok(vec![])
//! #     }
//! # }
//!
//! fn main() -> swarmlm_client::Result<()> {
//!     let backend = HttpSessionBackend::new("http://localhost:9090")?;
//!     let controller = GenerationController::new(backend);
//!
//!     let options = GenerateOptions {
//!         max_new_tokens: Some(50),
//!         ..Default::default()
//!     };
//!     let tokens = controller.generate(&GreedyDecoder, Some(&[1, 2, 3]), None, &options)?;
//!     println!("generated {} tokens", tokens.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod generation;
pub mod http;
pub mod session;

pub use error::{ClientError, Result};
pub use generation::{
    CacheReorder, GenerateOptions, GenerationAlgorithm, GenerationController, PastKeyValues,
};
pub use http::HttpSessionBackend;
pub use session::{
    CreateSessionRequest, CreateSessionResponse, InferenceSession, ReleaseSessionRequest,
    SessionBackend, SessionManager, SessionScope,
};
