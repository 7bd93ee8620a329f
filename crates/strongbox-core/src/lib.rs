//! Core library for Strongbox.
//!
//! Contains the encryption barrier and its keyring, the seal/unseal and
//! rekey ceremonies, the mount table and router, the ACL policy store, the
//! token and identity stores, the expiration manager, the audit broker,
//! and the [`core::Core`] that composes them. Depends on
//! `strongbox-storage` for physical persistence and knows nothing about
//! HTTP.

pub mod audit;
pub mod audit_file;
pub mod barrier;
pub mod core;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod identity;
pub mod keyring;
pub mod mount;
pub mod policy;
pub mod rekey;
pub mod router;
pub mod seal;
pub mod token;
