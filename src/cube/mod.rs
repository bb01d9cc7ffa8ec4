//! The materialized trends cube: storage, bulk population, incremental
//! maintenance, read-side rollups and reconciliation.

pub mod populate;
pub mod query;
pub mod reconcile;
pub mod store;
pub mod update;
