//! Wire-level CAN message types and the CANopen message envelope built on top of them.

use snafu::Snafu;

use crate::sdo::{SdoRequest, SdoResponse};

/// An error reported by a CAN transport (see `CanBus` in `canopen-node`).
#[derive(Debug, Clone, Snafu)]
pub enum CanError {
    /// The underlying interface is down or was never brought up
    #[snafu(display("CAN interface is down"))]
    InterfaceDown,
    /// The transport's send/receive queue could not accept another frame
    #[snafu(display("CAN transport queue is full"))]
    QueueFull,
    /// A lower level I/O or driver error occurred
    #[snafu(display("CAN I/O error: {message}"))]
    Io {
        /// Description of the underlying error
        message: String,
    },
}

/// A CAN arbitration identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A single CAN frame: an identifier plus up to 8 bytes of payload.
#[derive(Clone, Copy, Debug)]
pub struct CanMessage {
    /// The data payload of the message.
    ///
    /// Note, some bytes may be unused. Check dlc.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a new CAN message
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        assert!(
            dlc as usize <= MAX_DATA_LENGTH,
            "Data length exceeds maximum size of {MAX_DATA_LENGTH} bytes"
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self {
            id,
            dlc,
            data: buf,
            rtr: false,
        }
    }

    /// Create a new RTR message. RTR messages have no data payload.
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// The NMT state transition command specifier carried in an NMT command frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Transition the addressed node(s) to Operational
    Start = 1,
    /// Transition the addressed node(s) to Stopped
    Stop = 2,
    /// Transition the addressed node(s) to PreOperational
    EnterPreOp = 128,
    /// Reset application: re-initialize the whole OD to defaults
    ResetApp = 129,
    /// Reset communication: re-initialize only communication objects
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Decode the command specifier byte transmitted in the NMT command frame
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The COB-ID used for NMT commands, always node-independent.
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The default COB-ID used for SYNC messages.
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// Base COB-ID for heartbeat/bootup messages; node id is added.
pub const HEARTBEAT_ID: u16 = 0x700;
/// Base COB-ID for SDO requests (client -> server); node id is added.
pub const SDO_REQ_BASE: u16 = 0x600;
/// Base COB-ID for SDO responses (server -> client); node id is added.
pub const SDO_RESP_BASE: u16 = 0x580;

/// An NMT command frame.
#[derive(Clone, Copy, Debug)]
pub struct NmtCommand {
    /// The requested state transition
    pub cs: NmtCommandSpecifier,
    /// Target node id; 0 means broadcast to all nodes.
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs: cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        CanMessage::new(NMT_CMD_ID, &[cmd.cs as u8, cmd.node])
    }
}

/// The NMT node state, per CiA 301.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// Transient boot state; a node never remains here once initialization completes.
    Initialising = 0,
    /// Stopped: only NMT commands are served.
    Stopped = 4,
    /// Normal operation: SDO and PDO traffic are both served.
    Operational = 5,
    /// Awaiting a start command; SDO is served but PDOs are not transmitted.
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initialising => write!(f, "Initialising"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// Returned by [`NmtState::try_from`] when the byte does not encode a valid state.
#[derive(Clone, Copy, Debug)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initialising as u8 => Ok(Initialising),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat (or boot-up, when state is `Initialising`) message.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    /// The node id transmitting the heartbeat
    pub node: u8,
    /// Current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        CanMessage::new(CanId::Std(HEARTBEAT_ID | value.node as u16), &[value.state as u8])
    }
}

/// A SYNC message: an optional one-byte counter that increments and wraps.
#[derive(Clone, Copy, Debug)]
pub struct SyncObject {
    /// The counter value, present only when counter overflow (0x1019) is nonzero.
    pub count: Option<u8>,
    /// The COB-ID this SYNC was sent/received on (usually 0x080, but configurable via 0x1005).
    pub cob_id: CanId,
}

impl SyncObject {
    /// Construct a sync message with the given counter value and cob_id
    pub fn new(cob_id: CanId, count: Option<u8>) -> Self {
        Self { cob_id, count }
    }
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        match value.count {
            Some(c) => CanMessage::new(value.cob_id, &[c]),
            None => CanMessage::new(value.cob_id, &[]),
        }
    }
}

/// A dispatch-friendly view over the standard message kinds this node cares about.
#[derive(Clone, Copy, Debug)]
#[allow(missing_docs)]
pub enum CanOpenMessage {
    NmtCommand(NmtCommand),
    Sync(SyncObject),
    Heartbeat(Heartbeat),
    SdoRequest(SdoRequest),
    SdoResponse(SdoResponse),
}

/// Errors converting raw [`CanMessage`]s into typed CANopen messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some way
    MalformedMsg {
        /// The COB ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// Received ID
        cob_id: CanId,
        /// Expected ID
        expected: CanId,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The COB ID of the message does not correspond to a recognized message kind.
    ///
    /// Not surprising in general: most traffic on the bus (e.g. PDOs) is not one of these.
    UnrecognizedId {
        /// The unrecognized COB
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
}

/// Decode a message given this node's own id, so SDO/heartbeat framing can be recognized.
pub fn decode_for_node(msg: CanMessage, node_id: u8) -> Result<CanOpenMessage, MessageError> {
    let cob_id = msg.id();
    let raw = cob_id.raw();
    if cob_id == NMT_CMD_ID {
        Ok(CanOpenMessage::NmtCommand(msg.try_into()?))
    } else if raw == SYNC_ID.raw() {
        Ok(CanOpenMessage::Sync(SyncObject::new(
            cob_id,
            msg.data().first().copied(),
        )))
    } else if raw == HEARTBEAT_ID as u32 | node_id as u32 {
        let state: NmtState = msg
            .data()
            .first()
            .copied()
            .unwrap_or(0)
            .try_into()
            .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
        Ok(CanOpenMessage::Heartbeat(Heartbeat {
            node: node_id,
            state,
        }))
    } else if raw == SDO_REQ_BASE as u32 + node_id as u32 {
        let req: SdoRequest = msg
            .data()
            .try_into()
            .map_err(|_| MessageError::MalformedMsg { cob_id })?;
        Ok(CanOpenMessage::SdoRequest(req))
    } else if raw == SDO_RESP_BASE as u32 + node_id as u32 {
        let resp = SdoResponse::try_from(msg).map_err(|_| MessageError::MalformedMsg { cob_id })?;
        Ok(CanOpenMessage::SdoResponse(resp))
    } else {
        Err(MessageError::UnrecognizedId { cob_id })
    }
}
