//! Core data models for object reconciliation.
//!
//! `desired` is what configuration asks for, `observed` is what the store
//! reports, and `identity` ties both to one remote object. The `bucket` and
//! `object` row types back the SQLite transport and map onto its tables via
//! `sqlx::FromRow`.

pub mod bucket;
pub mod desired;
pub mod identity;
pub mod lock;
pub mod object;
pub mod observed;
