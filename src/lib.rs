//! docker-authz - Docker authorization plugin
//!
//! Answers the daemon's `AuthZPlugin` requests by evaluating a declarative
//! access-control model and policy. It exposes all modules for testing purposes.

pub mod authz;
pub mod errors;
pub mod plugin;
pub mod settings;
pub mod web;
