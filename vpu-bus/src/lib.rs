//! Encode session engine for Wave5-class stateful video encoders.
//!
//! A [`session::Session`] pairs raw source frames with bitstream buffers,
//! feeds them to the hardware through a [`hw::HardwareChannel`] and hands
//! each buffer back once the hardware reports on it. [`engine::EncoderEngine`]
//! runs a session on its own worker behind an async API.

mod completion;

pub mod buffer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod format;
pub mod hw;
pub mod irq;
pub mod params;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod state;

pub use engine::EncoderEngine;
pub use error::SessionError;
pub use session::Session;
