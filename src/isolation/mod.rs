//! Isolation layer: namespaces and capabilities

pub mod caps;
pub mod namespace;

pub use namespace::{NamespaceFd, NamespaceSnapshot};
