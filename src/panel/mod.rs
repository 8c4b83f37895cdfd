//! Access to the BT (Baota) panel that owns the reverse-proxy site registry.

pub mod client;
pub mod sites;

pub use client::{
    BaotaClient,
    Form,
    PanelApi,
};
