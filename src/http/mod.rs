//! HTTP protocol implementation.
//!
//! A small HTTP/1.1 front end: enough to read a client request, hand it to
//! the resolver and either forward it or answer with an error.
//!
//! - **`connection`**: per-client state machine
//! - **`parser`**: parses incoming HTTP requests from byte buffers
//! - **`request`**: HTTP request representation and header helpers
//! - **`response`**: locally generated responses (errors)
//! - **`writer`**: serializes and writes responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Resolve token, rewrite request
//!        └──────┬───────────┘
//!      resolved │        └──── rejected ───────┐
//!               ▼                              ▼
//!        ┌──────────────────┐           ┌──────────────┐
//!        │   Forwarding     │ ─ fail ─→ │   Writing    │ ← error response
//!        └──────┬───────────┘           └──────┬───────┘
//!               │ relayed                      ├─ Keep-Alive → Reading
//!               ▼                              └─ Close → Closed
//!            Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use keyrelay::http::connection::Connection;
//!
//! let mut conn = Connection::new(socket, resolver, proxy);
//! if let Err(e) = conn.run().await {
//!     tracing::error!("Connection error: {}", e);
//! }
//! ```

pub mod request;
pub mod response;
pub mod parser;
pub mod connection;
pub mod writer;
