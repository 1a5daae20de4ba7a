//! Shared CANopen protocol types.
//!
//! This crate holds the wire-level types that both a node implementation and a client/master
//! implementation need to agree on: CAN frames and identifiers, the object dictionary's type and
//! access model, and the SDO request/response framing with its abort codes. None of it is tied to
//! a particular transport or runtime; [`canopen_node`](../canopen_node/index.html) builds the
//! live stack on top of it.

pub mod messages;
pub mod node_id;
pub mod object_ids;
pub mod objects;
pub mod sdo;

pub use messages::{CanError, CanId, CanMessage};
pub use node_id::NodeId;
