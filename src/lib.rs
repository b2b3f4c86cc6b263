//-----------------------------------------------------------------------------
// Crate xcp_slave
// Path: src/lib.rs
//
// XCP V1.0 slave protocol layer for ECU style applications:
// command processor, dynamic DAQ configuration and the measurement event hot
// path, over a pluggable datagram transport and clock.
//
// The transport owns the slave instance and feeds received command packets
// into XcpSlave::command, application threads stream measurement data by
// calling XcpSlave::event on their cycle. Description file generation, the
// socket layer and the clock source live outside this crate.

// Submodules
mod addr;
mod clock;
mod cmd;
mod daq;
mod event;
mod slave;
mod transport;

// Wire level constants, part of the public surface for embedders and tools
pub mod protocol;

pub use addr::{AddressMap, HostRef, XCP_ADDR_EXT_RAW};
pub use clock::{MonotonicClock, XcpClock};
pub use daq::DaqListFlags;
pub use event::{EventListFull, XcpEventDescriptor};
pub use slave::{SessionStatus, XcpSlave, XcpSlaveBuilder};
pub use transport::{QueueTransport, TransportError, XcpTransport};
