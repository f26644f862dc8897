//! Core data model for published content.
//!
//! Asset and index types serialize to the JSON documents stored in the
//! backend. Object metadata is a flat string map read case-insensitively.

pub mod asset;
pub mod batch;
pub mod index;
pub mod metadata;
pub mod object;
