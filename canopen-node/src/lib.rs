//! Async CANopen device stack.
//!
//! Wires an [`od::ObjectDictionary`] built from an EDS to a [`bus::CanBus`], then runs the
//! protocol services on top of it: [`sdo_server`] (expedited/segmented/block transfer),
//! [`pdo`] (mapped process data, sync- and event-driven), and [`nmt`] (state machine, heartbeat,
//! SYNC production). [`node`] is the entry point that owns and supervises all of them.

pub mod bus;
pub mod error;
pub mod nmt;
pub mod node;
pub mod od;
pub mod pdo;
pub mod sdo_server;

pub use error::NodeError;
pub use node::Node;
