//! Pulse-train output engine for clockless (WS2812-style) LED strips.
//!
//! The engine drives a pulse peripheral whose per-lane ring buffer is far smaller than one
//! frame of pixel data. It keeps every lane fed with double-buffered, interrupt-driven
//! refills and multiplexes any number of strips onto the lanes the hardware provides.
//!
//! See [`Engine`](engine::Engine) for usage.
//!
//! # Glossary
//!
//! - **Lane:** one physical hardware transmission channel with its own small pulse buffer.
//! - **Job:** one logical LED strip's pending transmission request.
//! - **Waveform:** a pulse's (level, duration) segment pair representing one encoded bit.
//! - **Threshold/refill interrupt:** hardware notification that one half of a lane's buffer
//!   has been consumed and needs replenishing.
//! - **Latch/reset duration:** the minimum low-signal time a clockless LED protocol requires
//!   to commit ("latch") transmitted data before the next frame.
//! - **Bail-out:** forced early termination of a job when refill timing drifts too far from
//!   expectations, so the batch still completes.
#![cfg_attr(not(feature = "host"), no_std)]

// Logging macros must be declared before the modules that use them.
#[macro_use]
mod fmt;

pub mod completion;
pub mod engine;
mod error;
mod filler;
mod job;
pub mod lane;
mod scheduler;
#[cfg(feature = "host")]
pub mod sim;
pub mod sink;
pub mod source;
pub mod waveform;

// Re-export error types and result (used throughout)
pub use crate::error::{Error, Result};
pub use crate::job::JobHandle;
