//----------------------------------------------------------------------------------------------
// Module addr
// Translation between host memory references and the flat XCP (ext:u8, addr:u32) address space
// Addresses are relative to a per module base so they stay stable across process runs
// when the executable layout is stable

use once_cell::sync::OnceCell;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

//----------------------------------------------------------------------------------------------
// HostRef

/// A raw reference into host memory, the protocol side of an XCP address.
/// The protocol never owns the memory behind it: ODT entries and the MTA cursor
/// are weak references into application state kept alive by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRef(*mut u8);

// @@@@ Unsafe - HostRef is shared between the command thread and the measurement
// threads, it is a plain address and all accesses through it are unsafe anyway
unsafe impl Send for HostRef {}
unsafe impl Sync for HostRef {}

impl HostRef {
    /// The null reference, initial MTA value
    pub const NULL: HostRef = HostRef(std::ptr::null_mut());

    pub fn new(ptr: *mut u8) -> HostRef {
        HostRef(ptr)
    }

    pub fn from_usize(addr: usize) -> HostRef {
        HostRef(addr as *mut u8)
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Post increment step of the MTA cursor
    pub fn add(self, n: usize) -> HostRef {
        HostRef(self.0.wrapping_add(n))
    }
}

//----------------------------------------------------------------------------------------------
// AddressMap

/// Address extension reserved for well known raw pointers (e.g. the station id
/// string handed out by GET_ID). Never assigned to a real module.
pub const XCP_ADDR_EXT_RAW: u8 = 0xFF;

/// Maximum number of address extensions backed by loaded modules
pub const XCP_MAX_MODULE: usize = 8;

/// Maps XCP (ext, addr) pairs to host pointers and back.
/// Extension 0 is the main executable module, its load address is resolved
/// lazily and cached. Further extensions are registered explicitly with the
/// base address of the module they stand for.
#[derive(Debug, Default)]
pub struct AddressMap {
    main: OnceCell<usize>,
    modules: Vec<usize>,
}

impl AddressMap {
    /// Address map with lazy main module discovery
    pub fn new() -> AddressMap {
        AddressMap::default()
    }

    /// Address map over explicit module bases, first entry is extension 0.
    /// Used by embedders that anchor the address space themselves and by tests.
    pub fn with_modules(bases: &[usize]) -> AddressMap {
        assert!(!bases.is_empty() && bases.len() <= XCP_MAX_MODULE, "invalid module table");
        let main = OnceCell::new();
        main.set(bases[0]).ok();
        AddressMap {
            main,
            modules: bases[1..].to_vec(),
        }
    }

    /// Register a further module base, returns its address extension
    pub fn register_module(&mut self, base: usize) -> u8 {
        assert!(self.modules.len() + 1 < XCP_MAX_MODULE, "module table full");
        self.modules.push(base);
        self.modules.len() as u8
    }

    /// Base address of an extension, cached after first resolution
    fn base(&self, ext: u8) -> usize {
        match ext {
            0 => *self.main.get_or_init(|| {
                let base = main_module_base();
                info!("main module base addr = 0x{:X}", base);
                base
            }),
            XCP_ADDR_EXT_RAW => 0,
            ext => self.modules.get(ext as usize - 1).copied().unwrap_or(0),
        }
    }

    /// Resolve an XCP address to a host reference.
    /// No validation, the protocol admits out of bounds addresses and relies on
    /// higher layers or the OS to trap.
    pub fn ref_of(&self, ext: u8, addr: u32) -> HostRef {
        HostRef::from_usize(self.base(ext).wrapping_add(addr as usize))
    }

    /// Translate a host reference back to an XCP address.
    /// None if the pointer lies outside the 4 GiB window of every known module.
    pub fn addr_of(&self, host_ref: HostRef) -> Option<(u8, u32)> {
        let p = host_ref.as_usize();
        for ext in 0..=self.modules.len() as u8 {
            let base = self.base(ext);
            if p >= base && p - base <= u32::MAX as usize {
                return Some((ext, (p - base) as u32));
            }
        }
        None
    }
}

//----------------------------------------------------------------------------------------------
// Main module discovery

// Load address of the main executable, the program header entry with the empty
// name. Keeps XCP addresses usable with debug symbol based address update.
#[cfg(target_os = "linux")]
fn main_module_base() -> usize {
    unsafe extern "C" fn visit(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut libc::c_void) -> libc::c_int {
        let info = &*info;
        if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            *(data as *mut usize) = info.dlpi_addr as usize;
        }
        0
    }

    let mut base: usize = 0;
    // @@@@ Unsafe - libc call, the visitor only writes through the data pointer handed to it
    unsafe {
        libc::dl_iterate_phdr(Some(visit), &mut base as *mut usize as *mut libc::c_void);
    }
    base
}

#[cfg(not(target_os = "linux"))]
fn main_module_base() -> usize {
    // Absolute addressing on platforms without module discovery
    0
}

//----------------------------------------------------------------------------------------------
