//! Security layer for the skillkit host mesh: persistent host identity,
//! signed discovery, trust management, TLS material, peer authentication and
//! declarative security policy.

pub mod security;

pub use security::*;
