//! # cacheprog core
//!
//! An external cache backend for build tools that delegate their build cache
//! to a child process (Go's `GOCACHEPROG`).
//!
//! The build tool writes JSON requests to the child's stdin and reads JSON
//! responses from its stdout. Each `put` stores a build output under its
//! content hash (the output id) and records which action produced it; each
//! `get` resolves an action id back to the stored output.
//!
//! ## Layout
//!
//! - [`DiskStore`]: `actions/<action hex>` holds an output hex,
//!   `outputs/<output hex>` holds the artifact bytes
//! - [`Decoder`]/[`Encoder`]: framing of requests and responses
//! - [`Server`]: handshake, read loop and per-request handlers
//!
//! ## Example
//!
//! ```no_run
//! use cacheprog_core::{DiskStore, Server};
//! use std::io;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DiskStore::open("./build-cache")?;
//! let server = Server::new(store, io::stdout());
//!
//! // Handshake, then answer requests until stdin closes
//! let stats = server.run(io::stdin().lock())?;
//! eprintln!("served {} requests", stats.requests());
//! # Ok(())
//! # }
//! ```

mod codec;
mod error;
mod hash;
mod protocol;
mod server;
mod store;

pub use codec::{Decoder, Encoder};
pub use error::{Error, Result};
pub use hash::{HashId, validate_hex};
pub use protocol::{Command, KNOWN_COMMANDS, Request, Response};
pub use server::{Server, SessionStats};
pub use store::{ACTIONS_DIR, CacheStorage, DiskStore, OUTPUTS_DIR};
