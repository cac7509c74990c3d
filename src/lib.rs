//! Client for the Buttplug device-control protocol: wire codec, session
//! engine with keep-alive and response correlation, and a waveform-driven
//! pattern scheduler, plus a WebSocket transport and a mock server.

pub mod app;
pub mod client;
pub mod codec;
pub mod config;
pub mod mock;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod waveform;
