//----------------------------------------------------------------------------------------------
// Module protocol
// Wire level definitions of the XCP V1.0 slave dialect spoken by this crate:
// command codes, response codes, status and mode bits and the static
// configuration surface (packet ceilings, pool size, timestamp format)

//----------------------------------------------------------------------------------------------
// Configuration surface

/// Command/response packet ceiling (CTO/CRM)
pub const XCP_MAX_CTO: u8 = 252;

/// Data packet ceiling (DTO)
pub const XCP_MAX_DTO: u8 = 252;

/// Per ODT entry size cap, a single entry must fit a DTO after header and timestamp
pub const XCP_MAX_ODT_ENTRY_SIZE: u8 = XCP_MAX_DTO - DTO_HEADER_LEN as u8 - XCP_TIMESTAMP_SIZE as u8;

/// Default byte budget of the dynamic DAQ memory pool
pub const XCP_DAQ_POOL_BYTES: usize = 4096;

/// Capacity of the measurement event registry
pub const XCP_MAX_EVENT: usize = 256;

/// Timestamp width in a first ODT (1, 2 or 4 bytes)
pub const XCP_TIMESTAMP_SIZE: usize = 4;

/// ASAM resolution code of the DAQ clock, 3 = 1us
pub const XCP_TIMESTAMP_UNIT_1US: u8 = 3;

/// Clock ticks per timestamp unit
pub const XCP_TIMESTAMP_TICKS: u16 = 1;

/// Protocol layer version, major version in the high byte
pub const XCP_PROTOCOL_LAYER_VERSION: u16 = 0x0100;

/// Transport layer version, major version in the high byte
pub const XCP_TRANSPORT_LAYER_VERSION: u16 = 0x0100;

//----------------------------------------------------------------------------------------------
// Packet identifiers

/// Positive response packet identifier
pub const PID_RES: u8 = 0xFF;

/// Error response packet identifier
pub const PID_ERR: u8 = 0xFE;

/// DTO header length (relative ODT number, DAQ list number)
pub const DTO_HEADER_LEN: usize = 2;

/// Overrun indication bit in the first DTO byte
pub const DTO_OVERRUN: u8 = 0x80;

//----------------------------------------------------------------------------------------------
// Command codes

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNC: u8 = 0xFC;
pub const CC_GET_COMM_MODE_INFO: u8 = 0xFB;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_DOWNLOAD_MAX: u8 = 0xEE;

pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_FREE_DAQ: u8 = 0xD7;
pub const CC_ALLOC_DAQ: u8 = 0xD6;
pub const CC_ALLOC_ODT: u8 = 0xD5;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD4;
pub const CC_WRITE_DAQ_MULTIPLE: u8 = 0xC7;

//----------------------------------------------------------------------------------------------
// Command response codes

pub const CRC_CMD_SYNCH: u8 = 0x00;
pub const CRC_CMD_BUSY: u8 = 0x10;
pub const CRC_DAQ_ACTIVE: u8 = 0x11;
pub const CRC_PRM_ACTIVE: u8 = 0x12;
pub const CRC_CMD_UNKNOWN: u8 = 0x20;
pub const CRC_CMD_SYNTAX: u8 = 0x21;
pub const CRC_OUT_OF_RANGE: u8 = 0x22;
pub const CRC_WRITE_PROTECTED: u8 = 0x23;
pub const CRC_ACCESS_DENIED: u8 = 0x24;
pub const CRC_ACCESS_LOCKED: u8 = 0x25;
pub const CRC_PAGE_NOT_VALID: u8 = 0x26;
pub const CRC_PAGE_MODE_NOT_VALID: u8 = 0x27;
pub const CRC_SEGMENT_NOT_VALID: u8 = 0x28;
pub const CRC_SEQUENCE: u8 = 0x29;
pub const CRC_DAQ_CONFIG: u8 = 0x2A;
pub const CRC_MEMORY_OVERFLOW: u8 = 0x30;
pub const CRC_GENERIC: u8 = 0x31;
pub const CRC_VERIFY: u8 = 0x32;

/// Response code name for log output
pub fn crc_name(code: u8) -> &'static str {
    match code {
        CRC_CMD_SYNCH => "CRC_CMD_SYNCH",
        CRC_CMD_BUSY => "CRC_CMD_BUSY",
        CRC_DAQ_ACTIVE => "CRC_DAQ_ACTIVE",
        CRC_PRM_ACTIVE => "CRC_PRM_ACTIVE",
        CRC_CMD_UNKNOWN => "CRC_CMD_UNKNOWN",
        CRC_CMD_SYNTAX => "CRC_CMD_SYNTAX",
        CRC_OUT_OF_RANGE => "CRC_OUT_OF_RANGE",
        CRC_WRITE_PROTECTED => "CRC_WRITE_PROTECTED",
        CRC_ACCESS_DENIED => "CRC_ACCESS_DENIED",
        CRC_ACCESS_LOCKED => "CRC_ACCESS_LOCKED",
        CRC_PAGE_NOT_VALID => "CRC_PAGE_NOT_VALID",
        CRC_PAGE_MODE_NOT_VALID => "CRC_PAGE_MODE_NOT_VALID",
        CRC_SEGMENT_NOT_VALID => "CRC_SEGMENT_NOT_VALID",
        CRC_SEQUENCE => "CRC_SEQUENCE",
        CRC_DAQ_CONFIG => "CRC_DAQ_CONFIG",
        CRC_MEMORY_OVERFLOW => "CRC_MEMORY_OVERFLOW",
        CRC_GENERIC => "CRC_GENERIC",
        CRC_VERIFY => "CRC_VERIFY",
        _ => "unknown error code",
    }
}

//----------------------------------------------------------------------------------------------
// GET_ID identification types

pub const IDT_ASCII: u8 = 0;
pub const IDT_ASAM_NAME: u8 = 1;
pub const IDT_ASAM_PATH: u8 = 2;
pub const IDT_ASAM_URL: u8 = 3;
pub const IDT_ASAM_UPLOAD: u8 = 4;

//----------------------------------------------------------------------------------------------
// CONNECT response bits

/// DAQ resource available
pub const RES_DAQ: u8 = 0x01;

/// COMM_MODE_BASIC: optional communication mode commands available
pub const CMB_OPTIONAL: u8 = 0x80;

/// COMM_MODE_BASIC: multi byte fields are big endian
pub const CMB_MOTOROLA: u8 = 0x01;

//----------------------------------------------------------------------------------------------
// GET_DAQ_PROCESSOR_INFO bits

/// DAQ lists are allocated dynamically
pub const DAQ_PROPERTY_CONFIG_TYPE: u8 = 0x01;

/// DTO packets carry timestamps
pub const DAQ_PROPERTY_TIMESTAMP: u8 = 0x10;

/// Overload indication through the PID high bit
pub const DAQ_PROPERTY_OVERLOAD_INDICATION_PID: u8 = 0x40;

/// DTO identification field: relative ODT number, absolute DAQ list number (byte)
pub const DAQ_HDR_ODT_DAQB: u8 = 0x20;

//----------------------------------------------------------------------------------------------
// GET_DAQ_RESOLUTION_INFO bits

/// Timestamp format is fixed, cannot be switched off by the master
pub const DAQ_TIMESTAMP_FIXED: u8 = 0x08;

/// Timestamp mode byte: unit code in the high nibble, fixed flag, size in bytes
pub const DAQ_TIMESTAMP_MODE: u8 =
    (XCP_TIMESTAMP_UNIT_1US << 4) | DAQ_TIMESTAMP_FIXED | XCP_TIMESTAMP_SIZE as u8;

//----------------------------------------------------------------------------------------------
// START_STOP modes

pub const DAQ_LIST_MODE_STOP: u8 = 0;
pub const DAQ_LIST_MODE_START: u8 = 1;
pub const DAQ_LIST_MODE_SELECT: u8 = 2;

pub const DAQ_SYNCH_STOP_ALL: u8 = 0;
pub const DAQ_SYNCH_START_SELECTED: u8 = 1;
pub const DAQ_SYNCH_STOP_SELECTED: u8 = 2;
