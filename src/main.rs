//-----------------------------------------------------------------------------
// Application xcp_slave
// Demo XCP slave on UDP with a simulated ECU task
//
// The command thread (main) feeds datagrams from the socket into the slave,
// the ECU task thread updates the measured signals and fires one measurement
// event per cycle. Connect a calibration tool to the advertised port and
// measure the logged addresses.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use clap::Parser;
use parking_lot::Mutex;

use xcp_slave::{AddressMap, HostRef, MonotonicClock, TransportError, XcpSlave, XcpSlaveBuilder, XcpTransport};

//-----------------------------------------------------------------------------
// Command line arguments

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Port number
    #[arg(short, long, default_value_t = 5555)]
    port: u16,
}

fn log_filter(level: u8) -> log::LevelFilter {
    match level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

//-----------------------------------------------------------------------------
// UDP transport
// One datagram per XCP packet, responses and DTOs go to the master that sent
// the last command

struct UdpTransport {
    socket: UdpSocket,
    master: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    fn new(socket: UdpSocket) -> UdpTransport {
        UdpTransport {
            socket,
            master: Mutex::new(None),
        }
    }

    fn set_master(&self, addr: SocketAddr) {
        let mut m = self.master.lock();
        if *m != Some(addr) {
            info!("master at {}", addr);
            *m = Some(addr);
        }
    }
}

impl XcpTransport for UdpTransport {
    fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        match *self.master.lock() {
            Some(addr) => {
                self.socket.send_to(packet, addr)?;
                Ok(())
            }
            None => Ok(()), // no master yet, nothing to deliver to
        }
    }
}

//-----------------------------------------------------------------------------
// Simulated ECU signals
// Static so their addresses are stable relative to the module base

static ECU_COUNTER: AtomicU32 = AtomicU32::new(0);
static ECU_CHANNEL1: AtomicU64 = AtomicU64::new(0); // f64 sine signal, raw bits

const ECU_CYCLE_MS: u64 = 10;

fn ecu_task(slave: Arc<XcpSlave>, event: u16) {
    let mut time = 0.0f64;
    loop {
        thread::sleep(Duration::from_millis(ECU_CYCLE_MS));
        time += ECU_CYCLE_MS as f64 / 1000.0;

        ECU_COUNTER.fetch_add(1, Ordering::Relaxed);
        let channel1 = 100.0 * (2.0 * std::f64::consts::PI * time).sin();
        ECU_CHANNEL1.store(channel1.to_bits(), Ordering::Relaxed);

        slave.event(event as u8);
    }
}

fn log_signal_addr(map: &AddressMap, name: &str, p: *const ()) {
    match map.addr_of(HostRef::new(p as *mut u8)) {
        Some((ext, addr)) => info!("signal {} at {}:{:08X}h", name, ext, addr),
        None => warn!("signal {} outside the XCP address range", name),
    }
}

//-----------------------------------------------------------------------------

fn main() {
    let args = Args::parse();
    env_logger::Builder::new().filter_level(log_filter(args.log_level)).init();

    println!("XCP slave demo, UDP on {}:{}", args.bind, args.port);

    let socket = UdpSocket::bind((args.bind.as_str(), args.port)).expect("bind failed");
    let transport = Arc::new(UdpTransport::new(socket.try_clone().expect("socket clone failed")));

    let slave = Arc::new(
        XcpSlaveBuilder::new("xcp_slave_demo").start(transport.clone(), Arc::new(MonotonicClock::new())),
    );

    // Declare the ECU cycle event and publish the signal addresses for the tool
    let event = slave.create_event("ecu_cycle", ECU_CYCLE_MS as u16, 1, 12).expect("event registry full");
    if let Some(desc) = slave.get_event(event) {
        info!("event {} '{}' unit={} cycle={}", event, desc.name, desc.time_unit, desc.time_cycle);
    }
    log_signal_addr(slave.addr_map(), "ecu_counter", &ECU_COUNTER as *const _ as *const ());
    log_signal_addr(slave.addr_map(), "ecu_channel1", &ECU_CHANNEL1 as *const _ as *const ());

    {
        let slave = Arc::clone(&slave);
        thread::spawn(move || ecu_task(slave, event));
    }

    // Command loop: one datagram is one command packet
    let mut buf = [0u8; 8192];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                transport.set_master(from);
                slave.command(&buf[..n]);
            }
            Err(e) => {
                error!("socket receive failed: {}", e);
                break;
            }
        }
    }

    info!("shutdown");
}
