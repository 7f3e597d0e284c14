//! ondevice-session: native inference session manager for on-device LLMs.
//!
//! A session is one loaded model with its computation cache. The manager creates
//! and destroys sessions; each session runs at most one long operation at a time
//! (generation, embedding, snapshot I/O, adapter changes, benchmark) and rejects
//! the rest with `Busy`. Generations stream tokens through a callback, stop on
//! EOS, stop words or limits, and can be cancelled cooperatively.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod generation;
pub mod metrics;
pub mod server;
pub mod session;

pub use error::{ErrorKind, Result, SessionError};
pub use session::{Session, SessionManager};
