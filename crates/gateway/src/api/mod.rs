//! Request-side surface: backend abstraction, target selection, the unlock
//! responder, and the HTTP/JSON front-end.

pub mod backend;
pub mod http;
pub mod responder;
pub mod selector;
pub mod state;

pub use backend::{EnclaveBackend, SignerBackend, StubBackend};
pub use responder::{UnlockAdvice, UnlockResponder, UnlockResponderConfig};
pub use selector::{StaticSelector, StickySelector, TargetSelector};
pub use state::AppState;
