#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Relays requests from producer threads to an exclusive consumer thread.
//!
//! An emulated control processor (the producer) regularly needs the emulated graphics processor
//! (the consumer) to do something that only the consumer thread is allowed to do: read or write
//! a framebuffer pixel, present a frame, read a bounding box register, serialize its state.
//! This crate provides [`RequestRelay`], which queues such [`Request`]s from any number of
//! producer threads and executes them on the consumer thread when the consumer calls
//! [`RequestRelay::drain()`].
//!
//! The concrete effect of each request is provided by the embedder via the [`Backend`] trait.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use request_relay::{Backend, OutputSlot, Request, RequestRelay, SwapRequest};
//!
//! struct Framebuffer;
//!
//! impl Backend for Framebuffer {
//!     fn poke_color(&self, _x: u16, _y: u16, _value: u32) {}
//!     fn poke_depth(&self, _x: u16, _y: u16, _value: u32) {}
//!     fn peek_color(&self, _x: u16, _y: u16) -> u32 {
//!         0xFF00_00FF
//!     }
//!     fn peek_depth(&self, _x: u16, _y: u16) -> u32 {
//!         0
//!     }
//!     fn present(&self, _swap: &SwapRequest) {}
//!     fn read_bbox(&self, _index: usize) -> u32 {
//!         0
//!     }
//!     fn reset_command_buffer(&self) {}
//!     fn flush_perf_queries(&self) {}
//!     fn save_state(&self, _buffer: &mut Vec<u8>) {}
//!     fn flush_pending_work(&self) {}
//!     fn wake_consumer(&self) {}
//! }
//!
//! let relay = Arc::new(RequestRelay::new(Framebuffer));
//! let color = OutputSlot::new();
//!
//! let producer = thread::spawn({
//!     let relay = Arc::clone(&relay);
//!     let color = color.clone();
//!
//!     move || {
//!         // Blocks until the consumer has drained the queue.
//!         relay.submit(Request::EfbPeekColor { x: 3, y: 4, output: color }, true);
//!     }
//! });
//!
//! // The consumer thread's main loop.
//! while !producer.is_finished() {
//!     relay.drain_if_pending();
//!     thread::yield_now();
//! }
//!
//! producer.join().unwrap();
//! assert_eq!(color.get(), Some(0xFF00_00FF));
//! ```
//!
//! # Modes
//!
//! The relay can be disabled (requests are dropped, used while the consumer is not running) and
//! switched to passthrough mode (requests are executed immediately on the submitting thread,
//! used when producer and consumer share a thread). See [`RequestRelay`] for details, including
//! the delivery guarantees a disabled relay does not provide.
//!
//! # Observability
//!
//! The relay logs mode changes and dropped requests via [`tracing`] and records
//! framebuffer access counts and drain batch sizes as [`nm`] events.

mod backend;
mod constants;
mod metrics;
mod output;
mod relay;
mod request;

pub use backend::*;
pub(crate) use constants::*;
pub use output::*;
pub use relay::*;
pub use request::*;
