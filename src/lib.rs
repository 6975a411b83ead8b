#![deny(clippy::all)]

pub mod client;
pub mod fileio;
pub mod netascii;
mod options;
pub mod packet;
pub mod transport;
mod tftp_server;
// Re-export the server's public types
pub use crate::tftp_server::*;
mod tftp_proto;
pub use crate::fileio::IOAdapter;
pub use crate::tftp_proto::{State, TftpServerProto, Transfer, DEFAULT_BLOCKSIZE, MAX_TIMEOUTS};
