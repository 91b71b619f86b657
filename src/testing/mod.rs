//! Testing utilities and mock implementations
//!
//! Lets the connection, subscription and session layers run against an
//! in-memory broker, without network access.

pub mod mocks;

pub use mocks::*;
