// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A transport-agnostic implementation of the [RFC6455][rfc6455] websocket
//! protocol: the HTTP/1.1 opening handshake, the frame codec, and the
//! connection state machine, with no bundled I/O.
//!
//! The engine never reads or writes a socket itself. A host feeds it
//! inbound bytes through [`Engine::parse`] and implements [`HostCallbacks`]
//! to hand out output buffers, send frames, and receive lifecycle and
//! payload events. This makes the core usable from a blocking socket loop,
//! an async executor, or a bare-metal target with no heap: the only
//! allocation the engine itself performs is a handful of small, bounded
//! stack buffers for handshake nonces and close-frame payloads.
//!
//! # Basic usage
//!
//! ```ignore
//! use wisk::{Engine, Role, Url, buffer::{BufferType, HostCallbacks}};
//!
//! struct Host { /* owns the socket, a write buffer pool, etc. */ }
//!
//! impl HostCallbacks for Host {
//!     fn on_buffer_send(&mut self, ty: BufferType, min: usize, f: &mut dyn FnMut(&mut [u8]) -> usize) -> bool {
//!         // hand `f` a buffer of at least `min` bytes, then write it to the socket
//!         # let _ = (ty, min, f); true
//!     }
//!     fn on_close_transport(&mut self) { /* shut down the socket */ }
//!     fn rand(&mut self) -> u32 { 0 /* a real PRNG */ }
//! }
//!
//! let mut recv_buf = [0u8; 4096];
//! let url = Url::parse("ws://example.com/chat").unwrap();
//! let mut engine = Engine::new(Role::Client, url, &mut recv_buf, Host {});
//! engine.start().unwrap();
//! // feed inbound bytes to engine.parse(..) as the socket produces them
//! ```
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

pub mod access_control;
pub mod buffer;
pub mod domain;
mod engine;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod opcode;
pub mod url;
pub mod utf8;

pub use buffer::{BufferType, HostCallbacks};
pub use engine::{ConnectionState, Engine, EngineConfig, EngineError, Role};
pub use handshake::{HandshakeError, HandshakeFailure};
pub use opcode::OpCode;
pub use url::{Schema, Url, UrlError};
