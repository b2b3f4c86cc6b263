//----------------------------------------------------------------------------------------------
// Module cmd
// The command processor: one CTO in, one CRM out.
// Parsing and validation happen here, the handlers mutate the session and fill
// the response buffer. A handler either completes positively, or returns the
// protocol error code that becomes the negative response. Commands received
// while disconnected are dropped without a response, CONNECT is always
// answered.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::addr::{HostRef, XCP_ADDR_EXT_RAW};
use crate::daq::{DaqAllocError, DaqListFlags, OdtEntry};
use crate::protocol::*;
use crate::slave::{Session, SessionStatus, XcpSlave};

//----------------------------------------------------------------------------------------------
// Negative response code

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CmdError(pub u8);

impl From<DaqAllocError> for CmdError {
    fn from(e: DaqAllocError) -> CmdError {
        CmdError(match e {
            DaqAllocError::Sequence => CRC_SEQUENCE,
            DaqAllocError::OutOfRange => CRC_OUT_OF_RANGE,
            DaqAllocError::MemoryOverflow => CRC_MEMORY_OVERFLOW,
        })
    }
}

type CmdResult = Result<(), CmdError>;

//----------------------------------------------------------------------------------------------
// CTO field access

// Slice view over the received command, every field access is length checked.
// A request too short for the field it claims to carry counts as unknown.
struct Cto<'a>(&'a [u8]);

impl Cto<'_> {
    fn get_u8(&self, i: usize) -> Result<u8, CmdError> {
        self.0.get(i).copied().ok_or(CmdError(CRC_CMD_UNKNOWN))
    }

    fn get_u16(&self, i: usize) -> Result<u16, CmdError> {
        let b = self.0.get(i..i + 2).ok_or(CmdError(CRC_CMD_UNKNOWN))?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }

    fn get_u32(&self, i: usize) -> Result<u32, CmdError> {
        let b = self.0.get(i..i + 4).ok_or(CmdError(CRC_CMD_UNKNOWN))?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_slice(&self, i: usize, n: usize) -> Result<&[u8], CmdError> {
        self.0.get(i..i + n).ok_or(CmdError(CRC_CMD_UNKNOWN))
    }
}

//----------------------------------------------------------------------------------------------
// CRM assembly

// Response buffer, multi byte fields in host byte order as advertised at CONNECT
pub(crate) struct Crm {
    b: [u8; XCP_MAX_CTO as usize],
    len: usize,
}

impl Crm {
    fn positive() -> Crm {
        let mut crm = Crm {
            b: [0; XCP_MAX_CTO as usize],
            len: 1,
        };
        crm.b[0] = PID_RES;
        crm
    }

    fn negative(code: u8) -> Crm {
        let mut crm = Crm {
            b: [0; XCP_MAX_CTO as usize],
            len: 2,
        };
        crm.b[0] = PID_ERR;
        crm.b[1] = code;
        crm
    }

    fn push_u8(&mut self, v: u8) {
        self.b[self.len] = v;
        self.len += 1;
    }

    fn push_u16(&mut self, v: u16) {
        self.b[self.len..self.len + 2].copy_from_slice(&v.to_ne_bytes());
        self.len += 2;
    }

    fn push_u32(&mut self, v: u32) {
        self.b[self.len..self.len + 4].copy_from_slice(&v.to_ne_bytes());
        self.len += 4;
    }

    // Reserve n payload bytes and hand them out for filling
    fn alloc(&mut self, n: usize) -> &mut [u8] {
        let at = self.len;
        self.len += n;
        &mut self.b[at..at + n]
    }

    fn as_slice(&self) -> &[u8] {
        &self.b[..self.len]
    }
}

//----------------------------------------------------------------------------------------------
// Command processor

impl XcpSlave {
    /// Process one command packet.
    /// The response (positive or negative) goes out through the transport.
    /// Commands other than CONNECT are silently dropped while disconnected.
    pub fn command(&self, cro: &[u8]) {
        let Some(&cmd) = cro.first() else { return };

        let mut session = self.state.write();

        // CONNECT is handled first and always answered
        let crm = if cmd == CC_CONNECT {
            debug!("-> CONNECT mode={}", cro.get(1).copied().unwrap_or(0));
            self.cmd_connect(&mut session)
        } else {
            if !session.status.contains(SessionStatus::SS_CONNECTED) {
                trace!("-> {} ignored, not connected", cmd_name(cmd));
                return;
            }
            trace!("-> {} len={}", cmd_name(cmd), cro.len());

            let mut crm = Crm::positive();
            match self.dispatch(&mut session, cmd, &Cto(cro), &mut crm) {
                Ok(()) => crm,
                Err(CmdError(code)) => {
                    debug!("<- 0xFE error {:02X}h - {}", code, crc_name(code));
                    Crm::negative(code)
                }
            }
        };

        drop(session);
        if let Err(e) = self.transport.send(crm.as_slice()) {
            warn!("response transmit failed: {}", e);
            return;
        }
        self.transport.flush();
    }

    fn dispatch(&self, session: &mut Session, cmd: u8, cro: &Cto, crm: &mut Crm) -> CmdResult {
        match cmd {
            // Always answered negatively, the master uses it to resynchronize
            CC_SYNC => Err(CmdError(CRC_CMD_SYNCH)),

            CC_DISCONNECT => {
                debug!("-> DISCONNECT");
                self.disconnect(session);
                Ok(())
            }

            CC_GET_STATUS => self.cmd_get_status(session, crm),
            CC_GET_COMM_MODE_INFO => self.cmd_get_comm_mode_info(crm),
            CC_GET_ID => self.cmd_get_id(session, cro, crm),

            CC_SET_MTA => self.cmd_set_mta(session, cro),
            CC_DOWNLOAD => self.cmd_download(session, cro, false),
            CC_DOWNLOAD_MAX => self.cmd_download(session, cro, true),
            CC_UPLOAD => self.cmd_upload(session, cro, crm),
            CC_SHORT_UPLOAD => self.cmd_short_upload(session, cro, crm),

            CC_GET_DAQ_PROCESSOR_INFO => self.cmd_get_daq_processor_info(session, crm),
            CC_GET_DAQ_RESOLUTION_INFO => self.cmd_get_daq_resolution_info(crm),

            CC_FREE_DAQ => {
                debug!("-> FREE_DAQ");
                self.free_daq(session);
                Ok(())
            }
            CC_ALLOC_DAQ => {
                let count = cro.get_u8(1)?;
                debug!("-> ALLOC_DAQ count={}", count);
                Ok(session.pool.alloc_daq(count)?)
            }
            CC_ALLOC_ODT => {
                let daq = cro.get_u8(2)?;
                let count = cro.get_u8(3)?;
                debug!("-> ALLOC_ODT daq={} count={}", daq, count);
                Ok(session.pool.alloc_odt(daq, count)?)
            }
            CC_ALLOC_ODT_ENTRY => {
                let daq = cro.get_u8(2)?;
                let odt = cro.get_u8(3)?;
                let count = cro.get_u8(4)?;
                debug!("-> ALLOC_ODT_ENTRY daq={} odt={} count={}", daq, odt, count);
                Ok(session.pool.alloc_odt_entry(daq, odt, count)?)
            }

            CC_GET_DAQ_LIST_MODE => self.cmd_get_daq_list_mode(session, cro, crm),
            CC_SET_DAQ_LIST_MODE => self.cmd_set_daq_list_mode(session, cro),
            CC_SET_DAQ_PTR => self.cmd_set_daq_ptr(session, cro),
            CC_WRITE_DAQ => self.cmd_write_daq(session, cro),
            CC_WRITE_DAQ_MULTIPLE => self.cmd_write_daq_multiple(session, cro),
            CC_START_STOP_DAQ_LIST => self.cmd_start_stop_daq_list(session, cro, crm),
            CC_START_STOP_SYNCH => self.cmd_start_stop_synch(session, cro),
            CC_GET_DAQ_CLOCK => {
                crm.alloc(3); // aligns the timestamp
                crm.push_u32(self.clock.now());
                Ok(())
            }

            _ => {
                debug!("-> unknown command {:02X}h", cmd);
                Err(CmdError(CRC_CMD_UNKNOWN))
            }
        }
    }

    //------------------------------------------------------------------------------------------
    // Session commands

    // CONNECT resets the DAQ configuration and the session state
    fn cmd_connect(&self, session: &mut Session) -> Crm {
        self.free_daq(session);
        session.status = SessionStatus::SS_CONNECTED;
        session.set_mta(HostRef::NULL, 0);

        let mut crm = Crm::positive();
        crm.push_u8((XCP_PROTOCOL_LAYER_VERSION >> 8) as u8);
        crm.push_u8((XCP_TRANSPORT_LAYER_VERSION >> 8) as u8);
        crm.push_u8(XCP_MAX_CTO);
        crm.push_u16(XCP_MAX_DTO as u16);
        crm.push_u8(RES_DAQ);
        let mut comm_basic = CMB_OPTIONAL;
        if cfg!(target_endian = "big") {
            comm_basic |= CMB_MOTOROLA;
        }
        crm.push_u8(comm_basic);
        debug!("<- 0xFF maxcto={} maxdto={} resource={:02X}h", XCP_MAX_CTO, XCP_MAX_DTO, RES_DAQ);
        crm
    }

    fn cmd_get_status(&self, session: &Session, crm: &mut Crm) -> CmdResult {
        crm.push_u8(session.status.bits() as u8);
        crm.push_u8(0); // protection, no seed&key
        crm.push_u8(0);
        crm.push_u16(0); // session configuration id not available
        Ok(())
    }

    fn cmd_get_comm_mode_info(&self, crm: &mut Crm) -> CmdResult {
        // Driver version BCD coded, main version in the high nibble
        let version = ((XCP_PROTOCOL_LAYER_VERSION & 0x0F00) >> 4 | (XCP_PROTOCOL_LAYER_VERSION & 0x000F)) as u8;
        crm.push_u8(0);
        crm.push_u8(0); // no interleaved or master block mode
        crm.push_u8(0);
        crm.push_u8(0); // max bs
        crm.push_u8(0); // min st
        crm.push_u8(0); // queue size
        crm.push_u8(version);
        Ok(())
    }

    fn cmd_get_id(&self, session: &mut Session, cro: &Cto, crm: &mut Crm) -> CmdResult {
        let id_type = cro.get_u8(1)?;
        crm.push_u8(0); // transfer mode: data by upload
        crm.push_u16(0);
        if id_type == IDT_ASAM_NAME {
            // The station id is uploaded from the MTA, raw pointer extension
            let id = self.station_id();
            session.set_mta(HostRef::new(id.as_ptr() as *mut u8), XCP_ADDR_EXT_RAW);
            crm.push_u32(id.len() as u32);
        } else {
            crm.push_u32(0);
        }
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // Memory access commands

    fn cmd_set_mta(&self, session: &mut Session, cro: &Cto) -> CmdResult {
        let ext = cro.get_u8(3)?;
        let addr = cro.get_u32(4)?;
        trace!("-> SET_MTA addr={:08X}h ext={:02X}h", addr, ext);
        session.set_mta(self.addr_map().ref_of(ext, addr), ext);
        Ok(())
    }

    fn cmd_download(&self, session: &mut Session, cro: &Cto, max_sized: bool) -> CmdResult {
        let size = if max_sized { XCP_MAX_CTO - 4 } else { cro.get_u8(1)? };
        if size as usize > XCP_MAX_CTO as usize - 4 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        let data = cro.get_slice(4, size as usize)?;
        session.write_mta(data);
        Ok(())
    }

    fn cmd_upload(&self, session: &mut Session, cro: &Cto, crm: &mut Crm) -> CmdResult {
        let size = cro.get_u8(1)?;
        if size as usize > XCP_MAX_CTO as usize - 1 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        session.read_mta(crm.alloc(size as usize));
        Ok(())
    }

    fn cmd_short_upload(&self, session: &mut Session, cro: &Cto, crm: &mut Crm) -> CmdResult {
        let size = cro.get_u8(1)?;
        let ext = cro.get_u8(3)?;
        let addr = cro.get_u32(4)?;
        if size as usize > XCP_MAX_CTO as usize - 1 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        session.set_mta(self.addr_map().ref_of(ext, addr), ext);
        session.read_mta(crm.alloc(size as usize));
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // DAQ commands

    fn cmd_get_daq_processor_info(&self, session: &Session, crm: &mut Crm) -> CmdResult {
        crm.push_u8(DAQ_PROPERTY_CONFIG_TYPE | DAQ_PROPERTY_TIMESTAMP | DAQ_PROPERTY_OVERLOAD_INDICATION_PID);
        crm.push_u16(session.pool.daq_count() as u16);
        crm.push_u16(0); // available event channels unknown
        crm.push_u8(0); // no predefined lists
        crm.push_u8(DAQ_HDR_ODT_DAQB);
        Ok(())
    }

    fn cmd_get_daq_resolution_info(&self, crm: &mut Crm) -> CmdResult {
        crm.push_u8(1); // granularity daq
        crm.push_u8(XCP_MAX_ODT_ENTRY_SIZE);
        crm.push_u8(1); // granularity stim
        crm.push_u8(XCP_MAX_ODT_ENTRY_SIZE);
        crm.push_u8(DAQ_TIMESTAMP_MODE);
        crm.push_u16(XCP_TIMESTAMP_TICKS);
        Ok(())
    }

    fn cmd_get_daq_list_mode(&self, session: &Session, cro: &Cto, crm: &mut Crm) -> CmdResult {
        let daq = cro.get_u16(2)?;
        if daq >= session.pool.daq_count() as u16 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        let list = session.pool.list(daq as u8);
        crm.push_u8(list.load_flags().bits());
        crm.push_u16(0);
        crm.push_u16(list.event_channel);
        crm.push_u8(1); // prescaler
        crm.push_u8(0); // priority, prioritization not supported
        Ok(())
    }

    fn cmd_set_daq_list_mode(&self, session: &mut Session, cro: &Cto) -> CmdResult {
        let mode = cro.get_u8(1)?;
        let daq = cro.get_u16(2)?;
        let event = cro.get_u16(4)?;
        let priority = cro.get_u8(7)?;
        if daq >= session.pool.daq_count() as u16 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        if priority != 0 {
            // Prioritization not supported
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        debug!("-> SET_DAQ_LIST_MODE daq={} mode={:02X}h event={}", daq, mode, event);
        let list = session.pool.list_mut(daq as u8);
        list.event_channel = event;
        list.store_flags(DaqListFlags::from_bits_retain(mode));
        Ok(())
    }

    fn cmd_set_daq_ptr(&self, session: &mut Session, cro: &Cto) -> CmdResult {
        let daq = cro.get_u16(2)?;
        let odt = cro.get_u8(4)?;
        let idx = cro.get_u8(5)?;
        if daq >= session.pool.daq_count() as u16 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        let list = session.pool.list(daq as u8);
        if odt as u16 >= list.odt_count {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        let odt_rec = session.pool.odt(list.first_odt + odt as u16);
        if idx as u16 >= odt_rec.entry_count {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        trace!("-> SET_DAQ_PTR daq={} odt={} idx={}", daq, odt, idx);
        session.daq_list_ptr = odt_rec.first_odt_entry + idx as u16;
        Ok(())
    }

    // One ODT entry at the write cursor, post increment
    fn write_daq_entry(&self, session: &mut Session, size: u8, ext: u8, addr: u32) -> CmdResult {
        if size == 0 || size > XCP_MAX_ODT_ENTRY_SIZE {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        if session.pool.is_unconfigured() {
            return Err(CmdError(CRC_DAQ_CONFIG));
        }
        if session.daq_list_ptr >= session.pool.odt_entry_count() {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        let host_ref = self.addr_map().ref_of(ext, addr);
        *session.pool.entry_mut(session.daq_list_ptr) = OdtEntry { addr: host_ref, size };
        session.daq_list_ptr += 1;
        Ok(())
    }

    fn cmd_write_daq(&self, session: &mut Session, cro: &Cto) -> CmdResult {
        let size = cro.get_u8(2)?;
        let ext = cro.get_u8(3)?;
        let addr = cro.get_u32(4)?;
        trace!("-> WRITE_DAQ size={} addr={:08X}h ext={:02X}h", size, addr, ext);
        self.write_daq_entry(session, size, ext, addr)
    }

    fn cmd_write_daq_multiple(&self, session: &mut Session, cro: &Cto) -> CmdResult {
        let count = cro.get_u8(1)?;
        trace!("-> WRITE_DAQ_MULTIPLE count={}", count);
        for i in 0..count as usize {
            let at = 2 + i * 8;
            let bit_offset = cro.get_u8(at)?;
            let size = cro.get_u8(at + 1)?;
            let addr = cro.get_u32(at + 2)?;
            let ext = cro.get_u8(at + 6)?;
            if bit_offset != 0xFF {
                // Bit access not supported
                return Err(CmdError(CRC_OUT_OF_RANGE));
            }
            self.write_daq_entry(session, size, ext, addr)?;
        }
        Ok(())
    }

    fn cmd_start_stop_daq_list(&self, session: &mut Session, cro: &Cto, crm: &mut Crm) -> CmdResult {
        let mode = cro.get_u8(1)?;
        let daq = cro.get_u16(2)?;
        if session.pool.is_unconfigured() {
            return Err(CmdError(CRC_DAQ_CONFIG));
        }
        if daq >= session.pool.daq_count() as u16 {
            return Err(CmdError(CRC_OUT_OF_RANGE));
        }
        debug!("-> START_STOP_DAQ_LIST mode={} daq={}", mode, daq);
        if mode == DAQ_LIST_MODE_START || mode == DAQ_LIST_MODE_SELECT {
            session.pool.list(daq as u8).set_flags(DaqListFlags::SELECTED);
            if mode == DAQ_LIST_MODE_START {
                self.start_daq(session, daq as u8);
            }
            // First PID: absolute DAQ numbers, relative ODT numbers
            crm.push_u8(0);
        } else {
            self.stop_daq(session, daq as u8);
        }
        Ok(())
    }

    fn cmd_start_stop_synch(&self, session: &mut Session, cro: &Cto) -> CmdResult {
        let mode = cro.get_u8(1)?;
        if session.pool.is_unconfigured() {
            return Err(CmdError(CRC_DAQ_CONFIG));
        }
        debug!("-> START_STOP_SYNCH mode={}", mode);
        match mode {
            DAQ_SYNCH_STOP_SELECTED => self.stop_all_selected_daq(session),
            DAQ_SYNCH_START_SELECTED => self.start_all_selected_daq(session),
            _ => self.stop_all_daq(session),
        }
        Ok(())
    }
}

//----------------------------------------------------------------------------------------------
// Command names for trace output

fn cmd_name(cmd: u8) -> &'static str {
    match cmd {
        CC_CONNECT => "CONNECT",
        CC_DISCONNECT => "DISCONNECT",
        CC_GET_STATUS => "GET_STATUS",
        CC_SYNC => "SYNC",
        CC_GET_COMM_MODE_INFO => "GET_COMM_MODE_INFO",
        CC_GET_ID => "GET_ID",
        CC_SET_MTA => "SET_MTA",
        CC_UPLOAD => "UPLOAD",
        CC_SHORT_UPLOAD => "SHORT_UPLOAD",
        CC_DOWNLOAD => "DOWNLOAD",
        CC_DOWNLOAD_MAX => "DOWNLOAD_MAX",
        CC_SET_DAQ_PTR => "SET_DAQ_PTR",
        CC_WRITE_DAQ => "WRITE_DAQ",
        CC_WRITE_DAQ_MULTIPLE => "WRITE_DAQ_MULTIPLE",
        CC_SET_DAQ_LIST_MODE => "SET_DAQ_LIST_MODE",
        CC_GET_DAQ_LIST_MODE => "GET_DAQ_LIST_MODE",
        CC_START_STOP_DAQ_LIST => "START_STOP_DAQ_LIST",
        CC_START_STOP_SYNCH => "START_STOP_SYNCH",
        CC_GET_DAQ_CLOCK => "GET_DAQ_CLOCK",
        CC_GET_DAQ_PROCESSOR_INFO => "GET_DAQ_PROCESSOR_INFO",
        CC_GET_DAQ_RESOLUTION_INFO => "GET_DAQ_RESOLUTION_INFO",
        CC_FREE_DAQ => "FREE_DAQ",
        CC_ALLOC_DAQ => "ALLOC_DAQ",
        CC_ALLOC_ODT => "ALLOC_ODT",
        CC_ALLOC_ODT_ENTRY => "ALLOC_ODT_ENTRY",
        _ => "UNKNOWN",
    }
}

//----------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cto_bounds() {
        let cto = Cto(&[0xF5, 0x04]);
        assert_eq!(cto.get_u8(1), Ok(4));
        assert_eq!(cto.get_u8(2), Err(CmdError(CRC_CMD_UNKNOWN)));
        assert_eq!(cto.get_u16(1), Err(CmdError(CRC_CMD_UNKNOWN)));
        assert_eq!(cto.get_u32(0), Err(CmdError(CRC_CMD_UNKNOWN)));
        assert!(cto.get_slice(0, 2).is_ok());
        assert!(cto.get_slice(1, 2).is_err());
    }

    #[test]
    fn test_crm_framing() {
        let mut crm = Crm::positive();
        crm.push_u8(0xAB);
        crm.push_u16(0x1234);
        let expected: &[u8] = &[0xFF, 0xAB, 0x34, 0x12];
        if cfg!(target_endian = "little") {
            assert_eq!(crm.as_slice(), expected);
        }

        let crm = Crm::negative(CRC_SEQUENCE);
        assert_eq!(crm.as_slice(), &[0xFE, 0x29]);
    }
}
