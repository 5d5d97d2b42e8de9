//! Lease-backed liveness for coordination recipes.

pub mod session;

pub use session::{Session, SessionOptions};
