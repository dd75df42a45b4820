//! Photo enrichment scheduling and face-identity reconciliation.
//!
//! [`enrichment`] runs a photo's enrichers in dependency waves, and
//! [`enrichers`] holds the ones this crate ships. [`faces`] keeps a face
//! provider's users and samples in step with the local persons and resolves
//! newly detected faces against it.

pub mod config;
pub mod discovery;
pub mod enrichers;
pub mod enrichment;
pub mod error;
pub mod faces;
pub mod logging;
pub mod photo;
pub mod retry;
pub mod store;
