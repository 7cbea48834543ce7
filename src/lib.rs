//! Offline resource cache and background-sync engine for the Touchline
//! sports front end.
//!
//! The engine intercepts every outbound HTTP request of the hosting
//! application, resolves it through an ordered rule table of caching
//! strategies, persists failed mutating requests for later replay, and
//! reconciles cache generations across deployments. See [`engine::Engine`]
//! for the actor that ties the pieces together.

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod engine;
pub mod net;
pub mod notify;
pub mod queue;
pub mod request;
pub mod rules;
pub mod strategy;
