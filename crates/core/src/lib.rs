//! Vigil core: shared types, errors, and the pure logic behind the query
//! filter language, presence escalation, and the reactivation challenge.
//!
//! This crate has zero internal dependencies so the store adapters, the
//! query cache, and the presence tracker can all reference the same
//! constants and state machines.

pub mod error;
pub mod filter;
pub mod presence;
pub mod reactivation;
pub mod types;
