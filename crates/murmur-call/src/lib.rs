// One-to-one call sessions signaled through a shared key-value store.

pub mod config;
pub mod error;
pub mod ice;
pub mod machine;
pub mod manager;
pub mod signaling;

pub use config::CallConfig;
pub use error::CallError;
pub use ice::{apply_candidates, CandidateBuffer};
pub use machine::{transition, CallState, EndReason, Event, Role, Transition};
pub use manager::{CallDeps, CallEvent, CallHandle, CallManager};
pub use signaling::CallSignaling;
