//! Publish static sites as content-addressed objects on key-value and
//! object storage, keep collections of them, collect unreferenced content,
//! and serve a collection with encoding negotiation.

pub mod commands;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
