//! Shared domain types for the VoiceLine runtime.
//!
//! Everything here is transport- and vendor-agnostic: the error type, the
//! process configuration, the call data model, the tenant context, and the
//! provider-neutral streaming/chat types that the adapter crates translate
//! to and from.

pub mod call;
pub mod config;
pub mod error;
pub mod msg;
pub mod stream;
pub mod tenant;
pub mod trace;
