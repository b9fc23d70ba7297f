//! Policy enforcement engine.
//!
//! A [`Model`] declares the shape of requests and policy rows, how rows are
//! matched and how matches combine. A [`Policy`] holds the rows and role links
//! loaded for that model. The [`Enforcer`] evaluates the model's matcher over
//! every row and applies the effect. Every failure path denies.

pub mod effect;
pub mod enforcer;
pub mod errors;
pub mod functions;
pub mod loader;
pub mod matcher;
pub mod model;
pub mod policy;
pub mod role;
pub mod types;

pub use enforcer::Enforcer;
pub use errors::AuthzError;
pub use model::Model;
pub use policy::{Policy, PolicyRule};
pub use types::{Decision, Request};
