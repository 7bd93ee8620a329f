//! HTTP route handlers, organized by subsystem:
//!
//! - `sys`: init, seal/unseal, rotation, rekey, generate-root, unwrap
//! - `audit`: audit device management
//! - `auth`: token creation, lookup, renewal, revocation
//! - `policy`: ACL policy CRUD
//! - `mounts`: engine mount management
//! - `leases`: lease lookup, renewal, revocation
//! - `logical`: catch-all dispatch through the mount router

pub mod audit;
pub mod auth;
pub mod leases;
pub mod logical;
pub mod mounts;
pub mod policy;
pub mod sys;
