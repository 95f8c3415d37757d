//! Host-side link to a serial-attached inference accelerator.
//!
//! [`frame`] encodes the wire format, [`dispatch`] runs one request at a
//! time over a [`transport::Transport`], and [`stream`] and [`session`] keep
//! the device busy with windowed or ping-pong pipelining. [`result`] splits
//! raw inference output into per-node views.

pub mod cancel;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod postprocess;
pub mod proto;
pub mod result;
pub mod session;
pub mod stats;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod sim;

pub use error::{LinkError, Result};
