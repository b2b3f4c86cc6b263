//----------------------------------------------------------------------------------------------
// Module daq
// Dynamic DAQ memory: DAQ lists, ODTs and ODT entries allocated out of one
// bounded pool through the staged ALLOC_DAQ / ALLOC_ODT / ALLOC_ODT_ENTRY
// protocol. The three record arrays are index addressed, their counts act as
// bump indices against the byte budget.

use std::mem::size_of;
use std::sync::atomic::{AtomicU8, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use bitflags::bitflags;
use thiserror::Error;

use crate::addr::HostRef;

//----------------------------------------------------------------------------------------------
// DaqListFlags

bitflags! {
    /// Mode and state bits of one DAQ list.
    /// SELECTED, RUNNING and OVERRUN are touched by the command processor and
    /// the measurement threads, so they live in an atomic byte per list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DaqListFlags: u8 {
        const SELECTED  = 0x01;
        const DIRECTION = 0x02;
        const TIMESTAMP = 0x10;
        const NO_PID    = 0x20;
        const RUNNING   = 0x40;
        const OVERRUN   = 0x80;
    }
}

impl DaqListFlags {
    /// Master configured mode bits, kept across start/stop
    pub const MODE_MASK: DaqListFlags = DaqListFlags::DIRECTION.union(DaqListFlags::TIMESTAMP).union(DaqListFlags::NO_PID);
}

//----------------------------------------------------------------------------------------------
// Records

/// Undefined event channel of a freshly allocated DAQ list
pub const UNDEFINED_EVENT_CHANNEL: u16 = 0xFFFF;

/// One configured DAQ list: the ODT range it owns and its event binding.
/// Ranges are stored as first index plus count, a list that never received
/// ODTs reports zero and cannot alias slot 0.
#[derive(Debug)]
pub struct DaqList {
    pub first_odt: u16,
    pub odt_count: u16,
    pub event_channel: u16,
    flags: AtomicU8,
}

impl Default for DaqList {
    fn default() -> Self {
        DaqList {
            first_odt: 0,
            odt_count: 0,
            event_channel: UNDEFINED_EVENT_CHANNEL,
            flags: AtomicU8::new(0),
        }
    }
}

impl DaqList {
    pub fn load_flags(&self) -> DaqListFlags {
        DaqListFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    pub fn store_flags(&self, flags: DaqListFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    pub fn set_flags(&self, flags: DaqListFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_flags(&self, flags: DaqListFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }
}

/// One ODT: the ODT entry range packed into one DTO.
/// An ODT whose entries were never allocated has entry_count 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct Odt {
    pub first_odt_entry: u16,
    pub entry_count: u16,
}

/// One ODT entry, a contiguous region to sample
#[derive(Debug, Clone, Copy)]
pub struct OdtEntry {
    pub addr: HostRef,
    pub size: u8,
}

impl Default for OdtEntry {
    fn default() -> Self {
        OdtEntry { addr: HostRef::NULL, size: 0 }
    }
}

//----------------------------------------------------------------------------------------------
// Allocation errors

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqAllocError {
    #[error("allocation step out of order")]
    Sequence,

    #[error("count or index out of range")]
    OutOfRange,

    #[error("daq memory pool exhausted")]
    MemoryOverflow,
}

//----------------------------------------------------------------------------------------------
// DaqPool

/// Bounded arena for the dynamic DAQ configuration.
/// Allocation is staged: all DAQ lists first, then the ODTs of each list, then
/// the ODT entries of each ODT. Every step validates the prospective size
/// against the byte budget before committing, a failed step leaves the pool
/// untouched. Only FREE_DAQ (or CONNECT) releases anything.
#[derive(Debug)]
pub struct DaqPool {
    capacity: usize,
    lists: Vec<DaqList>,
    odts: Vec<Odt>,
    entries: Vec<OdtEntry>,
}

// Arena accounting: list and ODT records by their in-memory size, entries as
// one host reference plus one size byte
fn arena_bytes(daq: usize, odt: usize, entry: usize) -> usize {
    daq * size_of::<DaqList>() + odt * size_of::<Odt>() + entry * (size_of::<HostRef>() + 1)
}

impl DaqPool {
    pub fn new(capacity: usize) -> DaqPool {
        DaqPool {
            capacity,
            lists: Vec::new(),
            odts: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Release all DAQ lists, ODTs and entries
    pub fn free(&mut self) {
        trace!(
            "free daq pool, {}/{} bytes held {} lists, {} odts, {} entries",
            self.used_bytes(),
            self.capacity(),
            self.daq_count(),
            self.odt_count(),
            self.odt_entry_count()
        );
        self.lists.clear();
        self.odts.clear();
        self.entries.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        arena_bytes(self.lists.len(), self.odts.len(), self.entries.len())
    }

    pub fn daq_count(&self) -> u8 {
        self.lists.len() as u8
    }

    pub fn odt_count(&self) -> u16 {
        self.odts.len() as u16
    }

    pub fn odt_entry_count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// True while any of the three levels is still unallocated.
    /// WRITE_DAQ and START_STOP are rejected in this state.
    pub fn is_unconfigured(&self) -> bool {
        self.lists.is_empty() || self.odts.is_empty() || self.entries.is_empty()
    }

    fn check_fit(&self, daq: usize, odt: usize, entry: usize) -> Result<(), DaqAllocError> {
        let s = arena_bytes(daq, odt, entry);
        if s > self.capacity {
            debug!("daq pool overflow, {}/{} bytes", s, self.capacity);
            return Err(DaqAllocError::MemoryOverflow);
        }
        trace!("daq pool {}/{} bytes used", s, self.capacity);
        Ok(())
    }

    /// First stage: allocate the DAQ lists
    pub fn alloc_daq(&mut self, count: u8) -> Result<(), DaqAllocError> {
        if !self.odts.is_empty() || !self.entries.is_empty() {
            return Err(DaqAllocError::Sequence);
        }
        if count == 0 {
            return Err(DaqAllocError::OutOfRange);
        }
        self.check_fit(count as usize, 0, 0)?;

        self.lists = (0..count).map(|_| DaqList::default()).collect();
        Ok(())
    }

    /// Second stage: append the ODTs of one DAQ list
    pub fn alloc_odt(&mut self, daq: u8, count: u8) -> Result<(), DaqAllocError> {
        if self.lists.is_empty() || !self.entries.is_empty() {
            return Err(DaqAllocError::Sequence);
        }
        if count == 0 || daq as usize >= self.lists.len() {
            return Err(DaqAllocError::OutOfRange);
        }
        self.check_fit(self.lists.len(), self.odts.len() + count as usize, 0)?;

        let first = self.odts.len() as u16;
        self.odts.extend((0..count).map(|_| Odt::default()));
        let list = &mut self.lists[daq as usize];
        list.first_odt = first;
        list.odt_count = count as u16;
        Ok(())
    }

    /// Third stage: append the entries of one ODT, `odt` is relative to the list
    pub fn alloc_odt_entry(&mut self, daq: u8, odt: u8, count: u8) -> Result<(), DaqAllocError> {
        if self.lists.is_empty() || self.odts.is_empty() {
            return Err(DaqAllocError::Sequence);
        }
        if count == 0 || daq as usize >= self.lists.len() {
            return Err(DaqAllocError::OutOfRange);
        }
        let list = &self.lists[daq as usize];
        if odt as u16 >= list.odt_count {
            return Err(DaqAllocError::OutOfRange);
        }
        // The absolute entry index is a word on the wire
        if self.entries.len() + count as usize > 0xFFFF {
            return Err(DaqAllocError::MemoryOverflow);
        }
        self.check_fit(self.lists.len(), self.odts.len(), self.entries.len() + count as usize)?;

        let abs_odt = (list.first_odt + odt as u16) as usize;
        let first = self.entries.len() as u16;
        self.entries.extend((0..count).map(|_| OdtEntry::default()));
        self.odts[abs_odt].first_odt_entry = first;
        self.odts[abs_odt].entry_count = count as u16;
        Ok(())
    }

    //------------------------------------------------------------------------------------------
    // Record access

    pub fn lists(&self) -> &[DaqList] {
        &self.lists
    }

    pub fn list(&self, daq: u8) -> &DaqList {
        &self.lists[daq as usize]
    }

    pub fn list_mut(&mut self, daq: u8) -> &mut DaqList {
        &mut self.lists[daq as usize]
    }

    pub fn odt(&self, odt: u16) -> &Odt {
        &self.odts[odt as usize]
    }

    pub fn entry(&self, idx: u16) -> &OdtEntry {
        &self.entries[idx as usize]
    }

    pub fn entry_mut(&mut self, idx: u16) -> &mut OdtEntry {
        &mut self.entries[idx as usize]
    }
}

//----------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_staged_allocation() {
        let mut pool = DaqPool::new(1024);
        pool.alloc_daq(2).unwrap();
        pool.alloc_odt(0, 2).unwrap();
        pool.alloc_odt(1, 1).unwrap();
        pool.alloc_odt_entry(0, 0, 3).unwrap();
        pool.alloc_odt_entry(0, 1, 1).unwrap();
        pool.alloc_odt_entry(1, 0, 2).unwrap();

        assert_eq!(pool.daq_count(), 2);
        assert_eq!(pool.odt_count(), 3);
        assert_eq!(pool.odt_entry_count(), 6);

        // Ranges partition the arrays without overlap
        assert_eq!((pool.list(0).first_odt, pool.list(0).odt_count), (0, 2));
        assert_eq!((pool.list(1).first_odt, pool.list(1).odt_count), (2, 1));
        assert_eq!((pool.odt(0).first_odt_entry, pool.odt(0).entry_count), (0, 3));
        assert_eq!((pool.odt(1).first_odt_entry, pool.odt(1).entry_count), (3, 1));
        assert_eq!((pool.odt(2).first_odt_entry, pool.odt(2).entry_count), (4, 2));

        let per_list: u16 = pool.lists().iter().map(|l| l.odt_count).sum();
        assert_eq!(per_list, pool.odt_count());
        let per_odt: u16 = (0..pool.odt_count()).map(|o| pool.odt(o).entry_count).sum();
        assert_eq!(per_odt, pool.odt_entry_count());

        assert!(pool.used_bytes() <= pool.capacity());
    }

    #[test]
    fn test_unconfigured_records_own_nothing() {
        let mut pool = DaqPool::new(1024);
        pool.alloc_daq(2).unwrap();
        pool.alloc_odt(0, 1).unwrap();

        // List 1 never received ODTs, its entry allocation must not alias
        // list 0's ODT 0
        assert_eq!(pool.alloc_odt_entry(1, 0, 1), Err(DaqAllocError::OutOfRange));
        assert_eq!(pool.list(1).odt_count, 0);

        pool.alloc_odt_entry(0, 0, 1).unwrap();
        assert_eq!((pool.odt(0).first_odt_entry, pool.odt(0).entry_count), (0, 1));
        assert_eq!(pool.list(1).odt_count, 0);
    }

    #[test]
    fn test_sequence_violations() {
        let mut pool = DaqPool::new(1024);
        assert_eq!(pool.alloc_odt(0, 1), Err(DaqAllocError::Sequence));
        assert_eq!(pool.alloc_odt_entry(0, 0, 1), Err(DaqAllocError::Sequence));

        pool.alloc_daq(1).unwrap();
        assert_eq!(pool.alloc_odt_entry(0, 0, 1), Err(DaqAllocError::Sequence));

        pool.alloc_odt(0, 1).unwrap();
        pool.alloc_odt_entry(0, 0, 1).unwrap();
        // Once entries exist, earlier stages are sealed
        assert_eq!(pool.alloc_daq(1), Err(DaqAllocError::Sequence));
        assert_eq!(pool.alloc_odt(0, 1), Err(DaqAllocError::Sequence));
    }

    #[test]
    fn test_zero_counts_rejected() {
        let mut pool = DaqPool::new(1024);
        assert_eq!(pool.alloc_daq(0), Err(DaqAllocError::OutOfRange));
        pool.alloc_daq(1).unwrap();
        assert_eq!(pool.alloc_odt(0, 0), Err(DaqAllocError::OutOfRange));
        pool.alloc_odt(0, 1).unwrap();
        assert_eq!(pool.alloc_odt_entry(0, 0, 0), Err(DaqAllocError::OutOfRange));
    }

    #[test]
    fn test_index_bounds() {
        let mut pool = DaqPool::new(1024);
        pool.alloc_daq(1).unwrap();
        assert_eq!(pool.alloc_odt(1, 1), Err(DaqAllocError::OutOfRange));
        pool.alloc_odt(0, 1).unwrap();
        assert_eq!(pool.alloc_odt_entry(0, 1, 1), Err(DaqAllocError::OutOfRange));
        assert_eq!(pool.alloc_odt_entry(1, 0, 1), Err(DaqAllocError::OutOfRange));
    }

    #[test]
    fn test_overflow_leaves_pool_untouched() {
        let mut pool = DaqPool::new(512);
        assert_eq!(pool.alloc_daq(255), Err(DaqAllocError::MemoryOverflow));
        assert_eq!(pool.daq_count(), 0);
        assert_eq!(pool.used_bytes(), 0);

        // A fitting allocation still works afterwards
        pool.alloc_daq(1).unwrap();
        assert_eq!(pool.daq_count(), 1);

        // Entry overflow keeps the committed configuration
        pool.alloc_odt(0, 1).unwrap();
        assert_eq!(pool.alloc_odt_entry(0, 0, 255), Err(DaqAllocError::MemoryOverflow));
        assert_eq!(pool.odt_entry_count(), 0);
        assert_eq!(pool.odt_count(), 1);
    }

    #[test]
    fn test_entry_count_word_bound() {
        let mut pool = DaqPool::new(1_000_000);
        pool.alloc_daq(1).unwrap();
        pool.alloc_odt(0, 1).unwrap();
        for _ in 0..257 {
            pool.alloc_odt_entry(0, 0, 255).unwrap();
        }
        // 65535 entries allocated, the next batch would not fit a word index
        assert_eq!(pool.odt_entry_count(), 65535);
        assert_eq!(pool.alloc_odt_entry(0, 0, 1), Err(DaqAllocError::MemoryOverflow));
    }

    #[test]
    fn test_free_resets_everything() {
        let mut pool = DaqPool::new(1024);
        pool.alloc_daq(1).unwrap();
        pool.alloc_odt(0, 1).unwrap();
        pool.alloc_odt_entry(0, 0, 1).unwrap();
        pool.list(0).set_flags(DaqListFlags::SELECTED | DaqListFlags::RUNNING);

        pool.free();
        assert_eq!(pool.daq_count(), 0);
        assert_eq!(pool.odt_count(), 0);
        assert_eq!(pool.odt_entry_count(), 0);
        assert_eq!(pool.used_bytes(), 0);
        assert!(pool.is_unconfigured());
    }

    #[test]
    fn test_flag_updates() {
        let list = DaqList::default();
        list.set_flags(DaqListFlags::TIMESTAMP | DaqListFlags::SELECTED);
        list.set_flags(DaqListFlags::RUNNING);
        list.clear_flags(DaqListFlags::SELECTED);
        assert_eq!(list.load_flags(), DaqListFlags::TIMESTAMP | DaqListFlags::RUNNING);

        // Stop keeps only the master configured mode bits
        list.set_flags(DaqListFlags::OVERRUN);
        let kept = list.load_flags() & DaqListFlags::MODE_MASK;
        list.store_flags(kept);
        assert_eq!(list.load_flags(), DaqListFlags::TIMESTAMP);
    }
}
