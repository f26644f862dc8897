//! Publishing, retention and serve-time logic on top of the storage backends.

pub mod batch;
pub mod clean;
pub mod collections;
pub mod edge;
pub mod hashing;
pub mod keys;
pub mod publish;
pub mod resolve;
pub mod storage;
pub mod walk;
