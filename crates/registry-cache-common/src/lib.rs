//! registry-cache-common: identity derivation and shared names
//!
//! Both the control-plane operator and the node agent depend on this crate so
//! that names, labels and on-host paths are defined in exactly one place.

pub mod digest;
pub mod identity;
pub mod names;

pub use digest::content_digest;
pub use identity::{CacheIdentity, IdentityError, Scheme, Upstream};
