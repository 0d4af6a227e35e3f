//! WebSocket echo protocol.
//!
//! Every data message a client sends is written back to that same
//! client, unchanged:
//!
//! ```text
//! client -> Text("hello")      server -> Text("hello")
//! client -> Binary([1, 2, 3])  server -> Binary([1, 2, 3])
//! ```
//!
//! Each echo is fully sent before the next message is read, so replies
//! come back in the order the requests went out. Ping/pong and the
//! closing handshake are answered by tungstenite itself.

pub mod handler;

pub use handler::{echo_messages, Disconnect};
