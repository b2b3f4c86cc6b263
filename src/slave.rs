//----------------------------------------------------------------------------------------------
// Module slave
// The slave aggregate: session state behind a read/write latch, the pluggable
// transport/clock/address capabilities, and the DAQ event hot path.
//
// Locking model: the command processor holds the write latch for the duration
// of one CTO, measurement threads hold the read latch while packing DTOs. The
// per list SELECTED/RUNNING/OVERRUN bits are atomic so both sides may touch
// them under their latch. One mutex serializes the shared DTO scratch buffer,
// application threads may call event() concurrently but never from a signal
// handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::addr::{AddressMap, HostRef};
use crate::clock::XcpClock;
use crate::daq::{DaqListFlags, DaqPool};
use crate::event::{EventList, EventListFull, XcpEventDescriptor};
use crate::protocol::*;
use crate::transport::XcpTransport;

//----------------------------------------------------------------------------------------------
// Session status

bitflags! {
    /// XCP session status flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionStatus: u16 {
        const SS_DAQ       = 0x0040; // DAQ running
        const SS_CONNECTED = 0x2000;
    }
}

//----------------------------------------------------------------------------------------------
// Session

/// Mutable per session state, reset by CONNECT
pub(crate) struct Session {
    pub status: SessionStatus,
    /// Memory transfer address cursor consumed by UPLOAD/DOWNLOAD
    pub mta: HostRef,
    pub mta_ext: u8,
    /// Absolute ODT entry index targeted by the next WRITE_DAQ
    pub daq_list_ptr: u16,
    pub pool: DaqPool,
}

impl Session {
    fn new(pool_capacity: usize) -> Session {
        Session {
            status: SessionStatus::empty(),
            mta: HostRef::NULL,
            mta_ext: 0,
            daq_list_ptr: 0,
            pool: DaqPool::new(pool_capacity),
        }
    }

    pub fn set_mta(&mut self, mta: HostRef, ext: u8) {
        self.mta = mta;
        self.mta_ext = ext;
    }

    /// Copy bytes to the MTA cursor and advance it
    pub fn write_mta(&mut self, data: &[u8]) {
        trace!("write {} bytes to mta {:02X}h:{:p}", data.len(), self.mta_ext, self.mta.as_ptr());
        // @@@@ Unsafe - master directed memory write through the MTA cursor
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mta.as_ptr(), data.len());
        }
        self.mta = self.mta.add(data.len());
    }

    /// Copy bytes from the MTA cursor and advance it
    pub fn read_mta(&mut self, data: &mut [u8]) {
        trace!("read {} bytes from mta {:02X}h:{:p}", data.len(), self.mta_ext, self.mta.as_ptr());
        // @@@@ Unsafe - master directed memory read through the MTA cursor
        unsafe {
            std::ptr::copy_nonoverlapping(self.mta.as_ptr(), data.as_mut_ptr(), data.len());
        }
        self.mta = self.mta.add(data.len());
    }
}

// DTO scratch buffer shared by all measurement threads
struct DtoBuffer {
    b: [u8; XCP_MAX_DTO as usize],
}

//----------------------------------------------------------------------------------------------
// XcpSlaveBuilder

/// Builder for the slave instance
#[derive(Debug)]
pub struct XcpSlaveBuilder {
    station_id: String,
    pool_capacity: usize,
    addr_map: AddressMap,
}

impl XcpSlaveBuilder {
    /// Create a builder, `station_id` is the identifier returned by GET_ID
    /// (usually the basename of the description file)
    pub fn new(station_id: &str) -> XcpSlaveBuilder {
        XcpSlaveBuilder {
            station_id: station_id.to_string(),
            pool_capacity: XCP_DAQ_POOL_BYTES,
            addr_map: AddressMap::new(),
        }
    }

    /// Override the DAQ pool byte budget
    pub fn set_pool_capacity(mut self, bytes: usize) -> Self {
        self.pool_capacity = bytes;
        self
    }

    /// Override the address map (explicit module bases instead of discovery)
    pub fn set_addr_map(mut self, addr_map: AddressMap) -> Self {
        self.addr_map = addr_map;
        self
    }

    /// Start the protocol layer on the given transport and clock
    pub fn start(self, transport: Arc<dyn XcpTransport>, clock: Arc<dyn XcpClock>) -> XcpSlave {
        info!("start XCP protocol layer, station id '{}', pool {} bytes", self.station_id, self.pool_capacity);
        XcpSlave {
            station_id: self.station_id.into_boxed_str(),
            addr_map: self.addr_map,
            transport,
            clock,
            events: Mutex::new(EventList::new()),
            state: RwLock::new(Session::new(self.pool_capacity)),
            daq_running: AtomicBool::new(false),
            dto: Mutex::new(DtoBuffer { b: [0; XCP_MAX_DTO as usize] }),
        }
    }
}

//----------------------------------------------------------------------------------------------
// XcpSlave

/// An XCP slave instance.
/// The transport owns it (usually in an Arc): the command thread feeds CTOs
/// into `command`, application threads fire measurement events through
/// `event`/`event_ext`. Responses and DTOs go out through the transport.
pub struct XcpSlave {
    station_id: Box<str>,
    addr_map: AddressMap,
    pub(crate) transport: Arc<dyn XcpTransport>,
    pub(crate) clock: Arc<dyn XcpClock>,
    events: Mutex<EventList>,
    pub(crate) state: RwLock<Session>,
    daq_running: AtomicBool,
    dto: Mutex<DtoBuffer>,
}

impl XcpSlave {
    /// The station identifier returned by GET_ID type ASAM_NAME
    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn addr_map(&self) -> &AddressMap {
        &self.addr_map
    }

    /// XCP session status flags
    pub fn session_status(&self) -> SessionStatus {
        self.state.read().status
    }

    /// True after a successful CONNECT
    pub fn is_connected(&self) -> bool {
        self.state.read().status.contains(SessionStatus::SS_CONNECTED)
    }

    /// True while at least one DAQ list is running
    pub fn is_daq_running(&self) -> bool {
        self.daq_running.load(Ordering::Acquire)
    }

    /// Declare a measurement event channel, returns its channel number
    pub fn create_event(&self, name: &'static str, cycle_ms: u16, sample_count: u16, size: u32) -> Result<u16, EventListFull> {
        self.events.lock().create_event(name, cycle_ms, sample_count, size)
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Descriptor of a declared event channel
    pub fn get_event(&self, channel: u16) -> Option<XcpEventDescriptor> {
        self.events.lock().get(channel).cloned()
    }

    //------------------------------------------------------------------------------------------
    // DAQ list start/stop

    pub(crate) fn start_daq(&self, session: &mut Session, daq: u8) {
        session.pool.list(daq).set_flags(DaqListFlags::RUNNING);
        session.status.insert(SessionStatus::SS_DAQ);
        self.daq_running.store(true, Ordering::Release);
    }

    pub(crate) fn stop_daq(&self, session: &mut Session, daq: u8) {
        session.pool.list(daq).store_flags(session.pool.list(daq).load_flags() & DaqListFlags::MODE_MASK);

        // Clear the running state when the last list stopped
        if !session.pool.lists().iter().any(|l| l.load_flags().contains(DaqListFlags::RUNNING)) {
            session.status.remove(SessionStatus::SS_DAQ);
            self.daq_running.store(false, Ordering::Release);
        }
    }

    pub(crate) fn start_all_selected_daq(&self, session: &mut Session) {
        for daq in 0..session.pool.daq_count() {
            if session.pool.list(daq).load_flags().contains(DaqListFlags::SELECTED) {
                self.start_daq(session, daq);
                session.pool.list(daq).clear_flags(DaqListFlags::SELECTED);
            }
        }
    }

    pub(crate) fn stop_all_selected_daq(&self, session: &mut Session) {
        for daq in 0..session.pool.daq_count() {
            if session.pool.list(daq).load_flags().contains(DaqListFlags::SELECTED) {
                self.stop_daq(session, daq);
                session.pool.list(daq).clear_flags(DaqListFlags::SELECTED);
            }
        }
    }

    pub(crate) fn stop_all_daq(&self, session: &mut Session) {
        for daq in 0..session.pool.daq_count() {
            session.pool.list(daq).store_flags(session.pool.list(daq).load_flags() & DaqListFlags::MODE_MASK);
        }
        session.status.remove(SessionStatus::SS_DAQ);
        self.daq_running.store(false, Ordering::Release);
    }

    /// Release the DAQ configuration and stop measuring
    pub(crate) fn free_daq(&self, session: &mut Session) {
        session.status.remove(SessionStatus::SS_DAQ);
        self.daq_running.store(false, Ordering::Release);
        session.pool.free();
        session.daq_list_ptr = 0;
    }

    /// End the session: stop all DAQ lists, clear the connected state
    pub(crate) fn disconnect(&self, session: &mut Session) {
        session.status.remove(SessionStatus::SS_CONNECTED);
        self.stop_all_daq(session);
    }

    //------------------------------------------------------------------------------------------
    // DAQ event processing

    /// Fire a measurement event with absolute ODT entry addresses
    pub fn event(&self, channel: u8) {
        self.event_ext(channel, std::ptr::null());
    }

    /// Fire a measurement event.
    /// Walks all running DAQ lists bound to the channel and emits one DTO per
    /// ODT. Entry addresses are sampled relative to `base` (null = absolute).
    ///
    /// # Safety
    /// Not a safe operation in the strict sense: the bytes copied out are
    /// whatever the master configured via WRITE_DAQ. The embedder guarantees
    /// the configured regions stay readable while DAQ runs.
    pub fn event_ext(&self, channel: u8, base: *const u8) {
        if !self.daq_running.load(Ordering::Acquire) {
            return;
        }

        let session = self.state.read();
        let pool = &session.pool;

        for (daq, list) in pool.lists().iter().enumerate() {
            if !list.load_flags().contains(DaqListFlags::RUNNING) {
                continue;
            }
            if list.event_channel != channel as u16 {
                continue;
            }

            for odt in list.first_odt..list.first_odt + list.odt_count {
                // The scratch buffer and the overrun bit are shared, packing
                // one ODT is the critical section
                let mut dto = self.dto.lock();
                let buf = &mut dto.b;

                buf[0] = (odt - list.first_odt) as u8;
                buf[1] = daq as u8;
                let mut len = DTO_HEADER_LEN;

                // A pending overrun is signalled through bit 7 of the PID
                if list.load_flags().contains(DaqListFlags::OVERRUN) {
                    buf[0] |= DTO_OVERRUN;
                    list.clear_flags(DaqListFlags::OVERRUN);
                }

                // The first ODT of a list carries the timestamp
                if odt == list.first_odt {
                    let t = self.clock.now();
                    buf[len..len + XCP_TIMESTAMP_SIZE].copy_from_slice(&t.to_ne_bytes()[..XCP_TIMESTAMP_SIZE]);
                    len += XCP_TIMESTAMP_SIZE;
                }

                let odt_rec = pool.odt(odt);
                if odt_rec.entry_count == 0 || pool.entry(odt_rec.first_odt_entry).size == 0 {
                    // ODT not configured yet
                    continue;
                }
                for e in odt_rec.first_odt_entry..odt_rec.first_odt_entry + odt_rec.entry_count {
                    let entry = pool.entry(e);
                    let n = entry.size as usize;
                    if n == 0 {
                        break;
                    }
                    debug_assert!(len + n <= buf.len());
                    if len + n > buf.len() {
                        break;
                    }
                    let src = (base as usize).wrapping_add(entry.addr.as_usize()) as *const u8;
                    // @@@@ Unsafe - sample copy from the master configured region
                    unsafe {
                        std::ptr::copy_nonoverlapping(src, buf[len..].as_mut_ptr(), n);
                    }
                    len += n;
                }

                if self.transport.send(&buf[..len]).is_err() {
                    trace!("dto dropped, daq {} signals overrun", daq);
                    list.set_flags(DaqListFlags::OVERRUN);
                }
            }
        }
    }
}
