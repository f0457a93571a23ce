//! MicroPython raw REPL protocol pieces for replink.
//!
//! Everything in this crate is pure: control bytes and output markers, the
//! file transfer codec, the Python snippets sent to the device and the
//! parsers for what the device prints back. The async transport and session
//! machinery lives in the `replink` crate.

mod codec;
pub mod control;
mod device;
mod error;
pub mod script;
mod traceback;
mod tree;
mod uid;

pub use codec::{ChunkEncoding, decode_hex, encode_chunk, hexlify, literal_bytes};
pub use device::{DeviceInfo, FsStats};
pub use error::{ParseError, Result};
pub use traceback::{Frame, Traceback};
pub use tree::{FsNode, NodeKind, parse_walk};
pub use uid::ConnectionUid;
