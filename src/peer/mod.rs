//! Request/response path to the vehicle's embedded web server
//!
//! The car also serves the same commands over plain HTTP when the operator is on its
//! local network. This path bypasses the broker and the session state machine.

pub mod http;

pub use http::HttpPeer;
