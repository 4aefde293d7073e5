//! In-memory message relay for line-oriented TCP clients.
//!
//! Clients register a handle with `REG <handle>` and message each other with
//! `MSG @<handle> <len>//<body>`; an operator console lists who is online
//! (`CLIENTS`) and broadcasts to everyone (`ALL <text>`).
//!
//! - [`codec`] parses and formats the wire protocol. It holds no state.
//! - [`dispatcher`] owns the handle registry and serializes every mutation
//!   and routing decision on a single control loop.
//! - [`connection`] runs one read loop per client and turns lines into
//!   dispatcher requests.
//! - [`session`] holds the per-client outbound queue and its writer task.
//! - [`console`] drives `CLIENTS` and `ALL` from an operator console.
//! - [`server`] binds the pieces to a TCP listener; [`cli`] parses the binary's
//!   flags.

pub mod cli;
pub mod codec;
pub mod connection;
pub mod console;
pub mod dispatcher;
pub mod server;
pub mod session;
