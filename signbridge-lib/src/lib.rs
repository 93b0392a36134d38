pub mod call;
pub mod call_manager;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod negotiator;
pub mod session;
pub mod signaling;
pub mod store;

pub use crate::{
    call_manager::CallManager,
    error::{Error, Result},
    session::{CallSession, Role, SessionState},
};
