//! Declarative reconciliation for versioned objects in an S3-like store.
//!
//! Configuration describes what one object should look like; a cycle diffs
//! that against the store, decides the least disruptive [`reconcile::plan::Plan`]
//! and applies it through a [`transport::StorageTransport`].

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod reconcile;
pub mod routes;
pub mod state;
pub mod transport;
