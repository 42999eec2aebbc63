//! Multi-room audio control bridge.
//!
//! Connects a browser-based control surface to N independent player zones
//! (JSON-RPC over WebSocket, one connection per zone) and one multi-room
//! routing/volume daemon, and fans all of their event streams out through
//! one in-process bus.
//!
//! This library provides:
//! - Per-zone playback control with normalized event republication
//! - Routing-daemon commands and a live stream-list cache
//! - The shared event bus boundary used by every publisher
//! - An HTTP read surface for initial page state

#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod api;
pub mod bus;
pub mod config;
pub mod rpc;
