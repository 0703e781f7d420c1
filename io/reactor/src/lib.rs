//! io-reactor - Reactor-pattern event loop core.
//!
//! This crate provides the building blocks for a multi-loop TCP server:
//! a single-threaded cooperative [`EventLoop`] that demultiplexes readiness
//! across many descriptors, a per-descriptor [`Channel`] binding an interest
//! mask to a readiness callback, and pooled [`InputBuffer`]/[`OutputBuffer`]
//! types backed by a size-classed [`BufferPool`].
//!
//! # Threading model
//!
//! Each `EventLoop` is pinned to the thread that calls [`EventLoop::run`].
//! All channel and buffer mutation happens on that thread; other threads
//! interact with a loop only through [`EventLoop::run_in_loop`] and
//! [`EventLoop::queue_in_loop`], which wake the loop out of its blocking
//! wait.
//!
//! # Quick start
//!
//! ```ignore
//! use io_reactor::{Channel, EventLoop, Ready};
//!
//! let event_loop = EventLoop::new()?;
//! let channel = Channel::new(event_loop.clone(), fd);
//! channel.set_callback(move |ready: Ready| {
//!     if ready.is_readable() {
//!         // drain the descriptor
//!     }
//! });
//! channel.enable_read();
//! event_loop.run(); // blocks until stop()
//! ```

mod buffer;
mod buffer_pool;
mod channel;
mod event_loop;
mod poller;
mod ready;

pub use buffer::{BufferError, InputBuffer, OutputBuffer, MAX_OUTPUT_BYTES};
pub use buffer_pool::{BufferPool, Chunk, PoolError, PoolStats, CHUNK_SIZES, DEFAULT_MAX_POOL_BYTES};
pub use channel::Channel;
pub use event_loop::EventLoop;
pub use poller::Poller;
pub use ready::Ready;
