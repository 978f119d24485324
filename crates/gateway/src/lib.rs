//! The VoiceLine gateway: accepts carrier media streams and runs one
//! session orchestrator per call.

pub mod cli;
pub mod runtime;
pub mod server;
pub mod state;
