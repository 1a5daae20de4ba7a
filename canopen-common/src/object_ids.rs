//! Standard CiA 301 object indices used by the reserved-behavior entries.

/// Device type
pub const DEVICE_TYPE: u16 = 0x1000;
/// Error register
pub const ERROR_REGISTER: u16 = 0x1001;
/// COB-ID SYNC message
pub const COB_ID_SYNC: u16 = 0x1005;
/// Communication cycle period (SYNC), in microseconds
pub const COMMUNICATION_CYCLE_PERIOD: u16 = 0x1006;
/// Manufacturer device name
pub const DEVICE_NAME: u16 = 0x1008;
/// Manufacturer hardware version
pub const HARDWARE_VERSION: u16 = 0x1009;
/// Manufacturer software version
pub const SOFTWARE_VERSION: u16 = 0x100A;
/// Store parameters command object
pub const SAVE_OBJECTS: u16 = 0x1010;
/// Consumer heartbeat time table
pub const CONSUMER_HEARTBEAT_TIME: u16 = 0x1016;
/// Producer heartbeat time
pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
/// Identity record: vendor id, product code, revision, serial number
pub const IDENTITY: u16 = 0x1018;
/// Synchronous counter overflow value
pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;

/// First communication-parameter index of the RPDO range (0x1400..0x15FF)
pub const RPDO_COMM_BASE: u16 = 0x1400;
/// First mapping-parameter index of the RPDO range (0x1600..0x17FF)
pub const RPDO_MAPPING_BASE: u16 = 0x1600;
/// First communication-parameter index of the TPDO range (0x1800..0x19FF)
pub const TPDO_COMM_BASE: u16 = 0x1800;
/// First mapping-parameter index of the TPDO range (0x1A00..0x1BFF)
pub const TPDO_MAPPING_BASE: u16 = 0x1A00;

/// Number of RPDO/TPDO slots the node supports (1..4, per §6 COB-ID allocation)
pub const NUM_PDOS: u16 = 4;

/// Manufacturer-specific auto-start flag used by the example device profile
pub const AUTO_START: u16 = 0x5000;
