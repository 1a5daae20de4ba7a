//! Errors returned while building or running a node.

use canopen_common::{messages::CanError, node_id::InvalidNodeIdError};
use snafu::Snafu;

/// Errors that can occur while constructing a [`crate::node::Node`] or while it runs.
#[derive(Debug, Snafu)]
pub enum NodeError {
    /// The EDS file could not be loaded or did not parse
    #[snafu(display("failed to load EDS: {source}"))]
    Eds { source: canopen_eds::LoadError },

    /// The node id given on the command line or in config is not a legal CANopen node id
    #[snafu(display("invalid node id: {source}"))]
    InvalidNodeId { source: InvalidNodeIdError },

    /// The node was asked to run with an unconfigured node id (255)
    #[snafu(display("node id must be configured (1-127) to run the stack"))]
    UnconfiguredNodeId,

    /// Opening or using the CAN transport failed
    #[snafu(display("CAN bus error: {source}"))]
    Bus { source: CanError },

    /// An object named in the EDS does not have a value the node can use (e.g. a malformed
    /// default) and the node cannot safely start
    #[snafu(display("object 0x{index:04X}sub{sub:02X} in EDS is invalid: {reason}"))]
    InvalidObject { index: u16, sub: u8, reason: String },
}
