//! # tetherband-server
//!
//! HTTP server library for the tetherband daemon: API handlers, shared
//! state and logging setup.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
