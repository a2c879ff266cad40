//! HTTP endpoints over the sequencer engine.

#![warn(clippy::unwrap_used)]

pub mod auth;
pub mod rest;
pub mod server;
pub mod swagger;

pub use server::ApiServer;
pub use swagger::ApiDoc;
