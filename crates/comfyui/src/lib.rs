//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management with
//! reconnection, HTTP API wrappers, and [`ComfyUIEndpoint`], the adapter
//! that exposes one ComfyUI server to the dispatcher.

pub mod api;
pub mod client;
pub mod endpoint;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod workflow;

pub use endpoint::ComfyUIEndpoint;
