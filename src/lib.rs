//! echo-ring: a completion-queue-driven asynchronous TCP echo service.
//!
//! A single dispatch thread serves many concurrent connections by posting
//! non-blocking accept/receive/send operations against an io_uring
//! completion queue and reacting to completion notifications, instead of
//! dedicating a thread per connection.
//!
//! The wire protocol is a raw byte stream: each received chunk is one
//! logical message, echoed back with the ASCII prefix `Server:`.

pub mod config;
pub mod runtime;
