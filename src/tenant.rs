//! Tenant identity.
//!
//! Every operation in this crate takes the tenant as an explicit parameter.
//! There is deliberately no process-wide "current tenant" state: maintenance
//! tooling that hardcodes a tenant has historically been the source of cube
//! rows written for the wrong tenant.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// A newtype wrapper for integer tenant IDs.
///
/// This helps disambiguate tenant IDs from category and account IDs, leading
/// to better compile time errors when an ID is passed in the wrong position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(i64);

impl TenantId {
    /// Wrap a raw database ID as a tenant ID.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// The underlying database ID.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
