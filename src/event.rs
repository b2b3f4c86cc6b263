//----------------------------------------------------------------------------------------------
// Module event
// Registry of declared measurement event channels
// Events are purely descriptive, the DAQ engine identifies them by their integer id.
// The descriptors feed external tooling (e.g. an A2L exporter) with name, nominal
// cycle and payload size.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use thiserror::Error;

use crate::protocol::{XCP_MAX_EVENT, XCP_TIMESTAMP_UNIT_1US};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("event registry full")]
pub struct EventListFull;

//----------------------------------------------------------------------------------------------
// XcpEventDescriptor

/// One declared measurement event channel
#[derive(Debug, Clone)]
pub struct XcpEventDescriptor {
    pub name: &'static str,
    /// ASAM resolution code of the nominal cycle
    pub time_unit: u8,
    /// Nominal cycle in time_unit steps, 0 = sporadic
    pub time_cycle: u8,
    pub sample_count: u16,
    /// Payload size of one sample in bytes
    pub size: u32,
}

// Scale the nominal cycle to the ASAM (unit, cycle) pair: starting at the base
// resolution code, divide by 10 until the cycle fits in a byte
fn asam_cycle(mut cycle: u16) -> (u8, u8) {
    let mut unit = XCP_TIMESTAMP_UNIT_1US;
    while cycle >= 256 {
        cycle /= 10;
        unit += 1;
    }
    (unit, cycle as u8)
}

//----------------------------------------------------------------------------------------------
// EventList

/// Fixed capacity registry of event channels, filled once at startup
#[derive(Debug, Default)]
pub struct EventList(Vec<XcpEventDescriptor>);

impl EventList {
    pub fn new() -> EventList {
        EventList(Vec::new())
    }

    /// Declare an event channel, returns its channel number
    pub fn create_event(&mut self, name: &'static str, cycle_ms: u16, sample_count: u16, size: u32) -> Result<u16, EventListFull> {
        if self.0.len() >= XCP_MAX_EVENT {
            return Err(EventListFull);
        }
        let (time_unit, time_cycle) = asam_cycle(cycle_ms);
        let id = self.0.len() as u16;
        debug!("create event {}: {} unit={} cycle={} samplecount={}", id, name, time_unit, time_cycle, sample_count);
        self.0.push(XcpEventDescriptor {
            name,
            time_unit,
            time_cycle,
            sample_count,
            size,
        });
        Ok(id)
    }

    pub fn get(&self, id: u16) -> Option<&XcpEventDescriptor> {
        self.0.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

//----------------------------------------------------------------------------------------------
