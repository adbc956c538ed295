//! Core library for the sock_cond experiment controller.
//!
//! The controller runs odor/shock conditioning blocks on a rig made of an
//! odor valve bank, a shock pin and any number of cameras. A single session
//! task owns all state; devices, timers and video writers report back to it
//! through posted continuations.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod messages;
pub mod recording;
pub mod scheduler;
pub mod session;
