#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crab_xhci::{
    BusAddr, CompletionCode, Dci, DeviceContextAccess, DrainReport, EndpointConfig,
    EndpointState, EventHandler, EventRingInfo, Kernel, PortStatus, TrbData, USBError, Xhci,
    XhciConfig, XhciRegisters,
};
use xhci::ring::trb::{command, transfer};

pub const SLOT: u8 = 1;
pub const PAGE: usize = 0x1000;
/// Usable TRBs of a one-segment command ring.
const COMMAND_TRBS: u64 = 255;

thread_local! {
    /// `(address, value)` of the last dword of every range handed to the
    /// device, in program order. For a TRB that is its control dword.
    static FLUSHES: RefCell<Vec<(u64, u32)>> = const { RefCell::new(Vec::new()) };
}

/// Identity-mapped DMA: bus addresses are host addresses.
struct IdentityDma;

impl dma_api::Impl for IdentityDma {
    fn map(addr: NonNull<u8>, _size: usize, _direction: dma_api::Direction) -> u64 {
        addr.as_ptr() as u64
    }

    fn unmap(_addr: NonNull<u8>, _size: usize) {}

    fn flush(addr: NonNull<u8>, size: usize) {
        if size < 4 {
            return;
        }
        let last = addr.as_ptr() as u64 + size as u64 - 4;
        let value = read_u32(last);
        FLUSHES.with(|f| f.borrow_mut().push((last, value)));
    }

    fn invalidate(_addr: NonNull<u8>, _size: usize) {}
}

dma_api::set_impl!(IdentityDma);

pub fn read_u32(addr: u64) -> u32 {
    unsafe { (addr as *const u32).read_volatile() }
}

/// Stores the way the controller would: no flush, no journal.
pub fn write_u32(addr: u64, value: u32) {
    unsafe { (addr as *mut u32).write_volatile(value) }
}

pub fn read_trb(addr: u64) -> TrbData {
    TrbData::from_raw([
        read_u32(addr),
        read_u32(addr + 4),
        read_u32(addr + 8),
        read_u32(addr + 12),
    ])
}

/// Control dword goes last so the cycle bit flips only after the rest.
pub fn write_trb(addr: u64, raw: [u32; 4]) {
    for (i, dw) in raw.iter().enumerate() {
        write_u32(addr + i as u64 * 4, *dw);
    }
}

pub fn transfer_trb(addr: u64) -> transfer::Allowed {
    let trb = read_trb(addr);
    trb.transfer()
        .unwrap_or_else(|| panic!("no transfer TRB @{addr:#x}: {trb:?}"))
}

pub fn command_trb(addr: u64) -> command::Allowed {
    let trb = read_trb(addr);
    trb.command()
        .unwrap_or_else(|| panic!("no command TRB @{addr:#x}: {trb:?}"))
}

/// Monotonic clock plus the DMA flush journal.
pub struct TestKernel {
    now: Mutex<Duration>,
}

impl TestKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Duration::ZERO),
        })
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        read_u32(addr)
    }

    pub fn read_trb(&self, addr: u64) -> TrbData {
        read_trb(addr)
    }

    pub fn take_journal(&self) -> Vec<(u64, u32)> {
        FLUSHES.with(|f| std::mem::take(&mut *f.borrow_mut()))
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Kernel for TestKernel {
    fn page_size(&self) -> usize {
        PAGE
    }

    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Default)]
pub struct RegState {
    /// `(index, target | stream_id << 16)`
    pub doorbells: Vec<(u8, u32)>,
    pub crcr: Option<(BusAddr, bool)>,
    pub event_ring: Option<EventRingInfo>,
    pub erdp_writes: Vec<(u64, bool)>,
    pub acks: usize,
    pub ports: BTreeMap<u8, PortStatus>,
    pub port_acks: Vec<u8>,
    pub hse: bool,
    pub interrupts: bool,
    pub running: bool,
    pub halted: bool,
}

/// Register block that records what the engine does to it.
pub struct FakeRegs {
    pub state: Mutex<RegState>,
    pub max_ports: u8,
}

impl FakeRegs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegState::default()),
            max_ports: 4,
        })
    }

    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.state.lock().unwrap().doorbells.clone()
    }

    pub fn take_doorbells(&self) -> Vec<(u8, u32)> {
        std::mem::take(&mut self.state.lock().unwrap().doorbells)
    }

    pub fn set_port(&self, port: u8, status: PortStatus) {
        self.state.lock().unwrap().ports.insert(port, status);
    }

    pub fn raise_host_system_error(&self) {
        self.state.lock().unwrap().hse = true;
    }
}

impl XhciRegisters for FakeRegs {
    fn max_ports(&self) -> u8 {
        self.max_ports
    }

    fn ring_doorbell(&self, index: u8, target: u8, stream_id: u16) {
        self.state
            .lock()
            .unwrap()
            .doorbells
            .push((index, target as u32 | (stream_id as u32) << 16));
    }

    fn set_command_ring(&self, addr: BusAddr, cycle: bool) {
        self.state.lock().unwrap().crcr = Some((addr, cycle));
    }

    fn setup_event_ring(&self, _interrupter: u16, info: &EventRingInfo) {
        self.state.lock().unwrap().event_ring = Some(*info);
    }

    fn write_erdp(&self, _interrupter: u16, erdp: u64, clear_busy: bool) {
        self.state.lock().unwrap().erdp_writes.push((erdp, clear_busy));
    }

    fn ack_interrupt(&self, _interrupter: u16) {
        self.state.lock().unwrap().acks += 1;
    }

    fn ack_port_changes(&self, port_id: u8) -> PortStatus {
        let mut st = self.state.lock().unwrap();
        st.port_acks.push(port_id);
        let port = st.ports.entry(port_id).or_default();
        let seen = *port;
        port.changes = Default::default();
        seen
    }

    fn host_system_error(&self) -> bool {
        self.state.lock().unwrap().hse
    }

    fn set_interrupts(&self, _interrupter: u16, enable: bool) {
        self.state.lock().unwrap().interrupts = enable;
    }

    fn run(&self) {
        self.state.lock().unwrap().running = true;
    }

    fn halt(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        st.running = false;
        st.halted = true;
        true
    }
}

/// Device context table. Endpoints not set explicitly read as Running.
#[derive(Default)]
pub struct FakeContexts {
    states: Mutex<BTreeMap<(u8, u8), Option<EndpointState>>>,
}

impl FakeContexts {
    pub fn set(&self, slot_id: u8, dci: Dci, state: Option<EndpointState>) {
        self.states
            .lock()
            .unwrap()
            .insert((slot_id, dci.as_u8()), state);
    }
}

impl DeviceContextAccess for FakeContexts {
    fn endpoint_state(&self, slot_id: u8, dci: Dci) -> Option<EndpointState> {
        self.states
            .lock()
            .unwrap()
            .get(&(slot_id, dci.as_u8()))
            .copied()
            .unwrap_or(Some(EndpointState::Running))
    }
}

const TRANSFER_EVENT: u32 = 32;
const COMMAND_COMPLETION: u32 = 33;
const PORT_STATUS_CHANGE: u32 = 34;
const BANDWIDTH_REQUEST: u32 = 35;
const HOST_CONTROLLER: u32 = 37;
const DEVICE_NOTIFICATION: u32 = 38;
const MFINDEX_WRAP: u32 = 39;

/// Event TRBs as the controller lays them out, cycle bit clear.
pub mod raw {
    use super::*;

    fn ty(ty: u32) -> u32 {
        ty << 10
    }

    pub fn transfer_event(trb_addr: u64, code: u8, residue: usize, dci: u8, slot: u8) -> [u32; 4] {
        [
            trb_addr as u32,
            (trb_addr >> 32) as u32,
            (residue as u32 & 0xff_ffff) | (code as u32) << 24,
            ty(TRANSFER_EVENT) | (dci as u32) << 16 | (slot as u32) << 24,
        ]
    }

    pub fn command_completion(addr: u64, code: u8, parameter: u32, slot: u8) -> [u32; 4] {
        [
            addr as u32,
            (addr >> 32) as u32,
            (parameter & 0xff_ffff) | (code as u32) << 24,
            ty(COMMAND_COMPLETION) | (slot as u32) << 24,
        ]
    }

    pub fn port_status_change(port_id: u8) -> [u32; 4] {
        [
            (port_id as u32) << 24,
            0,
            (CompletionCode::Success as u32) << 24,
            ty(PORT_STATUS_CHANGE),
        ]
    }

    pub fn device_notification(slot: u8, kind: u8, data: u64) -> [u32; 4] {
        let field = data << 8 | (kind as u64 & 0xf) << 4;
        [
            field as u32,
            (field >> 32) as u32,
            (CompletionCode::Success as u32) << 24,
            ty(DEVICE_NOTIFICATION) | (slot as u32) << 24,
        ]
    }

    pub fn host_controller(code: CompletionCode) -> [u32; 4] {
        [0, 0, (code as u32) << 24, ty(HOST_CONTROLLER)]
    }

    pub fn bandwidth_request(slot: u8) -> [u32; 4] {
        [
            0,
            0,
            (CompletionCode::Success as u32) << 24,
            ty(BANDWIDTH_REQUEST) | (slot as u32) << 24,
        ]
    }

    pub fn mfindex_wrap() -> [u32; 4] {
        [0, 0, (CompletionCode::Success as u32) << 24, ty(MFINDEX_WRAP)]
    }
}

/// Writes events into the event ring the way the controller does.
pub struct EventProducer {
    segments: Vec<(u64, usize)>,
    seg: usize,
    idx: usize,
    cycle: bool,
}

impl EventProducer {
    pub fn new(info: EventRingInfo) -> Self {
        let segments = (0..info.erstz as u64)
            .map(|i| {
                let entry = info.erstba + i * 16;
                let lo = read_u32(entry) as u64;
                let hi = read_u32(entry + 4) as u64;
                let size = (read_u32(entry + 8) & 0xffff) as usize;
                (hi << 32 | lo, size)
            })
            .collect();
        Self {
            segments,
            seg: 0,
            idx: 0,
            cycle: true,
        }
    }

    pub fn segment_base(&self, seg: usize) -> u64 {
        self.segments[seg].0
    }

    pub fn next_addr(&self) -> u64 {
        self.segments[self.seg].0 + self.idx as u64 * 16
    }

    pub fn post(&mut self, mut raw: [u32; 4]) {
        raw[3] = (raw[3] & !1) | self.cycle as u32;
        write_trb(self.next_addr(), raw);
        self.idx += 1;
        if self.idx == self.segments[self.seg].1 {
            self.idx = 0;
            self.seg += 1;
            if self.seg == self.segments.len() {
                self.seg = 0;
                self.cycle = !self.cycle;
            }
        }
    }
}

pub struct Harness {
    pub kernel: Arc<TestKernel>,
    pub regs: Arc<FakeRegs>,
    pub contexts: Arc<FakeContexts>,
    pub xhci: Xhci,
    pub handler: EventHandler,
    pub events: EventProducer,
    completed_commands: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(XhciConfig::default())
    }

    pub fn with_config(config: XhciConfig) -> Self {
        let kernel = TestKernel::new();
        let regs = FakeRegs::new();
        let contexts = Arc::new(FakeContexts::default());
        let xhci = Xhci::new(kernel.clone(), regs.clone(), contexts.clone(), config).unwrap();
        xhci.init().unwrap();
        let handler = xhci.create_event_handler();
        let events = EventProducer::new(xhci.event_ring_info());
        Self {
            kernel,
            regs,
            contexts,
            xhci,
            handler,
            events,
            completed_commands: 0,
        }
    }

    /// Adds an endpoint and returns the bus address of its first TRB.
    pub fn endpoint(&self, dci: Dci, config: EndpointConfig) -> u64 {
        let deq = self.xhci.add_endpoint(SLOT, dci, config).unwrap();
        deq.raw() & !0xf
    }

    pub fn drain(&self) -> DrainReport {
        self.handler.handle_event()
    }

    pub fn drain_ok(&self) -> DrainReport {
        let report = self.drain();
        assert_eq!(report.errors, Vec::<USBError>::new());
        report
    }

    pub fn post_transfer(&mut self, dci: Dci, trb_addr: u64, code: CompletionCode, residue: usize) {
        self.post_transfer_code(dci, trb_addr, code as u8, residue);
    }

    /// Transfer event with a raw completion code, vendor band included.
    pub fn post_transfer_code(&mut self, dci: Dci, trb_addr: u64, code: u8, residue: usize) {
        self.events
            .post(raw::transfer_event(trb_addr, code, residue, dci.as_u8(), SLOT));
    }

    /// Address of the next command the controller would complete. The
    /// command ring is one segment, so this wraps through its link TRB.
    pub fn next_command_addr(&self) -> u64 {
        self.command_addr(0)
    }

    /// Address of the command `ahead` positions after the next one.
    pub fn command_addr(&self, ahead: u64) -> u64 {
        self.xhci.command_ring_addr().raw() + (self.completed_commands + ahead) % COMMAND_TRBS * 16
    }

    pub fn next_command(&self) -> command::Allowed {
        command_trb(self.next_command_addr())
    }

    /// Completes the oldest command still on the ring and returns it.
    pub fn complete_command(&mut self, code: CompletionCode) -> command::Allowed {
        let command = self.next_command();
        let addr = self.next_command_addr();
        self.post_command_completion(addr, code);
        self.completed_commands += 1;
        command
    }

    pub fn post_command_completion(&mut self, addr: u64, code: CompletionCode) {
        self.events
            .post(raw::command_completion(addr, code as u8, 0, SLOT));
    }
}
