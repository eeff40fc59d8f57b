//! Call-session state machine for two-party calls signalled over a shared
//! store.

pub mod config;
mod event;
mod expiry;
mod incoming;
mod relay;
pub mod session;
mod subscriptions;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use session::{spawn_session, Diagnostics, SessionContext, SessionHandle, SessionView, StepKind};
