#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # hearth
//!
//! hearth is a small static-file HTTP/1.x server built directly on
//! Linux readiness notification.
//!
//! ## Design
//!
//! - One acceptor thread per listen socket, with `SO_REUSEPORT` letting
//!   several acceptors share an address.
//! - N worker reactors, each owning an epoll set, a connection table, a
//!   timer wheel, and a small handler thread pool.
//! - One-shot interest per connection: the kernel disarms the fd when an
//!   event is delivered, so at most one handler runs per connection at a
//!   time, without per-connection locks doing any real work.
//! - Zero-copy bodies: response heads are written from an in-memory
//!   buffer, file bodies are spliced with `sendfile`.
//!
//! Keep-alive connections are recycled in place and evicted by an idle
//! timer when they go quiet.
//!
//! ```no_run
//! # fn main() -> hearth::Result<()> {
//! hearth::Server::builder()
//!     .root("./root")
//!     .bind("0.0.0.0:12345".parse().unwrap())
//!     .worker_threads(3)
//!     .worker_pool_size(4)
//!     .build()?
//!     .run()
//! # }
//! ```

pub use crate::error::{Error, Result};
pub use crate::proto::{Method, StatusCode, Version};
pub use crate::server::{Builder, Handle, Server};

mod common;
mod error;
mod mime;
mod pages;
pub mod proto;
pub mod server;
mod sys;
