#[macro_use]
extern crate tracing;

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod health;
pub mod panel;
pub mod reconcile;
pub mod resources;
pub mod scheduler;
pub mod state;
pub mod status;
