//! A scripted in-memory HAL and device model for driving the engine without
//! hardware.
//!
//! Pipe 0 is backed by a small chapter-9 device model that answers standard
//! requests out of canned descriptors; data pipes replay a per-pipe script of
//! actions (packets, NAKs, STALLs, faults). The frame counter advances by one
//! every time the engine reads it, so every SOF-based timeout elapses in
//! virtual time.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use usb2hcd::{
    DevicePolicy, DeviceState, HostController, HostHal, PipeConfig, PipeFault, PipeId, PipeToken,
    UsbEvent, PIPE_COUNT,
};

/// One scripted reaction of a data pipe to its next transaction.
#[derive(Clone, Debug)]
pub enum PipeAction {
    /// Deliver one IN packet.
    In(Vec<u8>),
    /// Accept one OUT packet.
    OutAck,
    Nak,
    Stall,
    Fault(PipeFault),
}

#[derive(Default)]
pub struct PipeRegs {
    pub token: Option<PipeToken>,
    pub frozen: bool,
    pub fifo: Vec<u8>,
    pub fifo_written: bool,
    pub setup_sent: bool,
    pub in_received: bool,
    pub out_sent: bool,
    pub stalled: bool,
    pub nak: bool,
    pub fault: Option<PipeFault>,
    pub irq_enabled: bool,
    pub irq_nak: bool,
    pub config: Option<PipeConfig>,
}

impl PipeRegs {
    fn any_flag(&self) -> bool {
        self.setup_sent
            || self.in_received
            || self.out_sent
            || self.stalled
            || self.nak
            || self.fault.is_some()
    }
}

/// The emulated device on the far side of the root port.
pub struct MockDevice {
    pub device_desc: Vec<u8>,
    pub config_desc: Vec<u8>,
    /// Raw string descriptors by index; index 0 is the LANGID table.
    pub strings: HashMap<u8, Vec<u8>>,
    pub address: u8,
    pub configured: Option<u8>,
    /// bRequest values the device STALLs (on the stage after SETUP).
    pub stall_requests: HashSet<u8>,
    /// Swallow every transaction after the SETUP ack; waits run to timeout.
    pub silent: bool,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            device_desc: device_descriptor(0x16c0, 0x05df, 64),
            config_desc: Vec::new(),
            strings: HashMap::new(),
            address: 0,
            configured: None,
            stall_requests: HashSet::new(),
            silent: false,
        }
    }
}

pub struct MockState {
    pub device: MockDevice,
    pub connected: bool,
    pub vbus: bool,
    pub low_speed: bool,
    pub frame: u64,
    pub sof_running: bool,
    pub sof_irq: bool,
    pub reset_sent: u32,
    pub reset_done: bool,
    pub resume_sent: bool,
    pub wakeup_armed: bool,
    pub events: UsbEvent,
    pub capacities: [u16; PIPE_COUNT],
    /// When false the frame counter freezes, so waits only end on an event.
    pub auto_advance: bool,
    pub pipes: [PipeRegs; PIPE_COUNT],
    /// Remaining control IN payload, already chunked is not needed; the
    /// model chunks by the control pipe's configured packet size on demand.
    ctrl_in: VecDeque<u8>,
    ctrl_in_active: bool,
    stall_next_ctrl: bool,
    /// Data-stage bytes the device accepted from OUT control transfers.
    pub ctrl_out_log: Vec<u8>,
    /// SETUP packets the device model has processed.
    pub setup_count: u32,
    /// Per-pipe transaction scripts.
    pub scripts: [VecDeque<PipeAction>; PIPE_COUNT],
    /// Payloads the device accepted on data pipes.
    pub out_log: Vec<(u8, Vec<u8>)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            device: MockDevice::default(),
            connected: true,
            vbus: true,
            low_speed: false,
            frame: 0,
            sof_running: false,
            sof_irq: false,
            reset_sent: 0,
            reset_done: false,
            resume_sent: false,
            wakeup_armed: false,
            events: UsbEvent::empty(),
            capacities: [64, 64, 64, 64, 64, 256, 512, 512],
            auto_advance: true,
            pipes: Default::default(),
            ctrl_in: VecDeque::new(),
            ctrl_in_active: false,
            stall_next_ctrl: false,
            ctrl_out_log: Vec::new(),
            setup_count: 0,
            scripts: Default::default(),
            out_log: Vec::new(),
        }
    }
}

impl MockState {
    fn ctrl_packet_size(&self) -> usize {
        self.pipes[0]
            .config
            .as_ref()
            .map(|c| usize::from(c.max_packet_size))
            .unwrap_or(8)
    }

    /// Parse the SETUP packet sitting in the pipe-0 FIFO and stage the
    /// device's reaction.
    fn process_setup(&mut self) {
        let fifo = std::mem::take(&mut self.pipes[0].fifo);
        if fifo.len() != 8 || self.device.silent {
            return;
        }
        let request = fifo[1];
        let value = u16::from_le_bytes([fifo[2], fifo[3]]);
        let length = usize::from(u16::from_le_bytes([fifo[6], fifo[7]]));

        self.setup_count += 1;
        self.pipes[0].setup_sent = true;
        self.ctrl_in.clear();
        self.ctrl_in_active = false;
        self.stall_next_ctrl = false;

        if self.device.stall_requests.contains(&request) {
            self.stall_next_ctrl = true;
            return;
        }

        match request {
            // GET_DESCRIPTOR
            0x06 => {
                let kind = (value >> 8) as u8;
                let index = value as u8;
                let payload = match kind {
                    1 => Some(self.device.device_desc.clone()),
                    2 => Some(self.device.config_desc.clone()),
                    3 => self.device.strings.get(&index).cloned(),
                    _ => None,
                };
                match payload {
                    Some(mut bytes) => {
                        bytes.truncate(length);
                        self.ctrl_in = bytes.into();
                        self.ctrl_in_active = true;
                    }
                    None => self.stall_next_ctrl = true,
                }
            }
            // SET_ADDRESS
            0x05 => self.device.address = value as u8,
            // GET_CONFIGURATION
            0x08 => {
                self.ctrl_in = vec![self.device.configured.unwrap_or(0)].into();
                self.ctrl_in_active = true;
            }
            // SET_CONFIGURATION
            0x09 => self.device.configured = Some(value as u8),
            // Everything else (CLEAR_FEATURE, SET_FEATURE, SET_INTERFACE,
            // vendor writes, ...) is accepted silently.
            _ => {}
        }
    }

    /// React to a pipe becoming (or staying) active without a pending flag.
    fn pump(&mut self, index: usize) {
        let regs = &self.pipes[index];
        if regs.frozen || regs.any_flag() {
            return;
        }
        if index == 0 {
            self.pump_control();
        } else {
            self.pump_data(index);
        }
    }

    fn pump_control(&mut self) {
        let Some(token) = self.pipes[0].token else {
            return;
        };
        if self.device.silent {
            return;
        }
        match token {
            PipeToken::Setup => {
                if !self.pipes[0].fifo.is_empty() {
                    self.process_setup();
                }
            }
            PipeToken::In => {
                if self.stall_next_ctrl {
                    self.pipes[0].stalled = true;
                    return;
                }
                let mps = self.ctrl_packet_size();
                let chunk: Vec<u8> = if self.ctrl_in_active {
                    let take = self.ctrl_in.len().min(mps);
                    let chunk = self.ctrl_in.drain(..take).collect();
                    if self.ctrl_in.is_empty() {
                        // A final full-sized packet is followed by a ZLP only
                        // conceptually; the model ends the stage on the short
                        // packet or the requested length, as the engine does.
                        self.ctrl_in_active = take == mps;
                    }
                    chunk
                } else {
                    // Status stage for host-to-device requests.
                    Vec::new()
                };
                self.pipes[0].fifo = chunk;
                self.pipes[0].in_received = true;
            }
            PipeToken::Out => {
                if self.stall_next_ctrl {
                    self.pipes[0].stalled = true;
                    return;
                }
                let fifo = std::mem::take(&mut self.pipes[0].fifo);
                self.ctrl_out_log.extend_from_slice(&fifo);
                self.pipes[0].out_sent = true;
            }
        }
    }

    fn pump_data(&mut self, index: usize) {
        let Some(token) = self.pipes[index].token else {
            return;
        };
        // OUT transactions only run once the engine has loaded the FIFO.
        if token == PipeToken::Out && !self.pipes[index].fifo_written {
            return;
        }
        let Some(action) = self.scripts[index].pop_front() else {
            return;
        };
        match action {
            PipeAction::In(data) => {
                self.pipes[index].fifo = data;
                self.pipes[index].in_received = true;
            }
            PipeAction::OutAck => {
                let fifo = std::mem::take(&mut self.pipes[index].fifo);
                self.pipes[index].fifo_written = false;
                self.out_log.push((index as u8, fifo));
                self.pipes[index].out_sent = true;
            }
            PipeAction::Nak => self.pipes[index].nak = true,
            PipeAction::Stall => self.pipes[index].stalled = true,
            PipeAction::Fault(fault) => self.pipes[index].fault = Some(fault),
        }
    }
}

/// Handle shared between the [`HostController`] and the test body.
#[derive(Clone)]
pub struct MockHandle(pub Arc<Mutex<MockState>>);

impl MockHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn frame(&self) -> u64 {
        self.0.lock().unwrap().frame
    }

    pub fn advance_frames(&self, n: u64) {
        self.0.lock().unwrap().frame += n;
    }

    pub fn push_event(&self, event: UsbEvent) {
        self.0.lock().unwrap().events |= event;
    }

    pub fn disconnect(&self) {
        let mut state = self.0.lock().unwrap();
        state.connected = false;
        state.events |= UsbEvent::DISCONNECTION;
    }

    pub fn script(&self, pipe: PipeId, actions: impl IntoIterator<Item = PipeAction>) {
        let mut state = self.0.lock().unwrap();
        state.scripts[pipe.index()].extend(actions);
    }
}

pub struct MockHal {
    state: Arc<Mutex<MockState>>,
}

impl MockHal {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle(state),
        )
    }
}

impl HostHal for MockHal {
    fn enable_vbus(&mut self) {}
    fn disable_vbus(&mut self) {
        self.state.lock().unwrap().vbus = false;
    }
    fn is_vbus_ok(&self) -> bool {
        self.state.lock().unwrap().vbus
    }
    fn is_device_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
    fn is_low_speed(&self) -> bool {
        self.state.lock().unwrap().low_speed
    }

    fn send_reset(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.reset_sent += 1;
        state.reset_done = false;
        // The model completes resets instantly; the engine still polls
        // `is_reset_done` before moving on.
        state.reset_done = true;
        state.device.address = 0;
        state.device.configured = None;
    }
    fn is_reset_done(&self) -> bool {
        self.state.lock().unwrap().reset_done
    }

    fn start_sof(&mut self) {
        self.state.lock().unwrap().sof_running = true;
    }
    fn stop_sof(&mut self) {
        self.state.lock().unwrap().sof_running = false;
    }
    fn frame_count(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        if state.auto_advance {
            state.frame += 1;
        }
        state.frame
    }
    fn sof_interrupt_enabled(&self) -> bool {
        self.state.lock().unwrap().sof_irq
    }
    fn set_sof_interrupt(&mut self, enabled: bool) {
        self.state.lock().unwrap().sof_irq = enabled;
    }

    fn send_resume(&mut self) {
        self.state.lock().unwrap().resume_sent = true;
    }
    fn is_resume_sent(&self) -> bool {
        self.state.lock().unwrap().resume_sent
    }
    fn arm_wakeup_interrupt(&mut self) {
        self.state.lock().unwrap().wakeup_armed = true;
    }

    fn take_events(&mut self) -> UsbEvent {
        let mut state = self.state.lock().unwrap();
        std::mem::replace(&mut state.events, UsbEvent::empty())
    }
    fn pipe_interrupt_mask(&self) -> u8 {
        let state = self.state.lock().unwrap();
        let mut mask = 0;
        for (i, pipe) in state.pipes.iter().enumerate() {
            if pipe.irq_enabled && pipe.any_flag() {
                mask |= 1 << i;
            }
        }
        mask
    }

    fn configure_pipe(&mut self, pipe: PipeId, config: &PipeConfig) {
        let mut state = self.state.lock().unwrap();
        let regs = &mut state.pipes[pipe.index()];
        regs.config = Some(*config);
        regs.frozen = true;
    }
    fn disable_pipe(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()] = PipeRegs::default();
    }
    fn reset_pipe(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        let config = state.pipes[pipe.index()].config;
        let irq = (
            state.pipes[pipe.index()].irq_enabled,
            state.pipes[pipe.index()].irq_nak,
        );
        state.pipes[pipe.index()] = PipeRegs {
            config,
            frozen: true,
            irq_enabled: irq.0,
            irq_nak: irq.1,
            ..PipeRegs::default()
        };
    }
    fn freeze_pipe(&mut self, pipe: PipeId) {
        self.state.lock().unwrap().pipes[pipe.index()].frozen = true;
    }
    fn unfreeze_pipe(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].frozen = false;
        state.pump(pipe.index());
    }
    fn set_token(&mut self, pipe: PipeId, token: PipeToken) {
        self.state.lock().unwrap().pipes[pipe.index()].token = Some(token);
    }
    fn pipe_capacity(&self, pipe: PipeId) -> u16 {
        self.state.lock().unwrap().capacities[pipe.index()]
    }
    fn enable_pipe_interrupts(&mut self, pipe: PipeId, with_nak: bool) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].irq_enabled = true;
        state.pipes[pipe.index()].irq_nak = with_nak;
    }
    fn disable_pipe_interrupts(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].irq_enabled = false;
        state.pipes[pipe.index()].irq_nak = false;
    }

    fn write_fifo(&mut self, pipe: PipeId, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].fifo = data.to_vec();
        state.pipes[pipe.index()].fifo_written = true;
    }
    fn read_fifo(&mut self, pipe: PipeId, buf: &mut [u8]) -> usize {
        let state = self.state.lock().unwrap();
        let fifo = &state.pipes[pipe.index()].fifo;
        let n = fifo.len().min(buf.len());
        buf[..n].copy_from_slice(&fifo[..n]);
        n
    }
    fn byte_count(&self, pipe: PipeId) -> u16 {
        self.state.lock().unwrap().pipes[pipe.index()].fifo.len() as u16
    }

    fn is_setup_sent(&self, pipe: PipeId) -> bool {
        self.state.lock().unwrap().pipes[pipe.index()].setup_sent
    }
    fn ack_setup_sent(&mut self, pipe: PipeId) {
        self.state.lock().unwrap().pipes[pipe.index()].setup_sent = false;
    }
    fn is_in_received(&self, pipe: PipeId) -> bool {
        self.state.lock().unwrap().pipes[pipe.index()].in_received
    }
    fn ack_in_received(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].in_received = false;
        state.pipes[pipe.index()].fifo.clear();
        // Control transactions are only initiated per-token via unfreeze;
        // data pipes keep transacting while unfrozen.
        if pipe.index() != 0 {
            state.pump(pipe.index());
        }
    }
    fn is_out_sent(&self, pipe: PipeId) -> bool {
        self.state.lock().unwrap().pipes[pipe.index()].out_sent
    }
    fn ack_out_sent(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].out_sent = false;
        if pipe.index() != 0 {
            state.pump(pipe.index());
        }
    }
    fn is_stalled(&self, pipe: PipeId) -> bool {
        self.state.lock().unwrap().pipes[pipe.index()].stalled
    }
    fn ack_stall(&mut self, pipe: PipeId) {
        self.state.lock().unwrap().pipes[pipe.index()].stalled = false;
    }
    fn is_nak(&self, pipe: PipeId) -> bool {
        self.state.lock().unwrap().pipes[pipe.index()].nak
    }
    fn ack_nak(&mut self, pipe: PipeId) {
        let mut state = self.state.lock().unwrap();
        state.pipes[pipe.index()].nak = false;
        if pipe.index() != 0 {
            state.pump(pipe.index());
        }
    }
    fn fault(&self, pipe: PipeId) -> Option<PipeFault> {
        self.state.lock().unwrap().pipes[pipe.index()].fault
    }
    fn ack_fault(&mut self, pipe: PipeId) {
        self.state.lock().unwrap().pipes[pipe.index()].fault = None;
    }
}

// --- Descriptor builders -------------------------------------------------

pub fn device_descriptor(vid: u16, pid: u16, packet_size: u8) -> Vec<u8> {
    vec![
        18, 1, // bLength, bDescriptorType
        0x00, 0x02, // bcdUSB 2.00
        0, 0, 0, // class, subclass, protocol (per interface)
        packet_size, // bMaxPacketSize0
        vid as u8,
        (vid >> 8) as u8,
        pid as u8,
        (pid >> 8) as u8,
        0x00, 0x01, // bcdDevice 1.00
        1, 2, 3, // iManufacturer, iProduct, iSerialNumber
        1, // bNumConfigurations
    ]
}

pub fn interface_descriptor(
    number: u8,
    endpoints: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> Vec<u8> {
    vec![9, 4, number, 0, endpoints, class, subclass, protocol, 0]
}

pub fn endpoint_descriptor(address: u8, attributes: u8, max_packet: u16, interval: u8) -> Vec<u8> {
    vec![
        7,
        5,
        address,
        attributes,
        max_packet as u8,
        (max_packet >> 8) as u8,
        interval,
    ]
}

/// Wrap interface/endpoint records into a full configuration descriptor
/// stream with a correct wTotalLength.
pub fn config_descriptor(configuration_value: u8, interfaces: u8, records: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for record in records {
        body.extend_from_slice(record);
    }
    let total = (9 + body.len()) as u16;
    let mut stream = vec![
        9,
        2,
        total as u8,
        (total >> 8) as u8,
        interfaces,
        configuration_value,
        0,
        0x80, // bus powered
        50,   // 100 mA
    ];
    stream.extend_from_slice(&body);
    stream
}

pub fn string_descriptor(text: &str) -> Vec<u8> {
    let mut bytes = vec![0, 3];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes[0] = bytes.len() as u8;
    bytes
}

pub fn langid_table() -> Vec<u8> {
    vec![4, 3, 0x09, 0x04]
}

// --- Harness helpers ------------------------------------------------------

/// A storage-flavoured device: one vendor interface that nothing matches and
/// one mass-storage interface with bulk IN/OUT plus an interrupt IN endpoint.
pub fn storage_device() -> MockDevice {
    let config = config_descriptor(
        1,
        2,
        &[
            interface_descriptor(0, 1, 0xff, 0x42, 0),
            endpoint_descriptor(0x83, 2, 64, 0),
            interface_descriptor(1, 3, 8, 6, 80),
            endpoint_descriptor(0x81, 2, 64, 0),
            endpoint_descriptor(0x02, 2, 64, 0),
            endpoint_descriptor(0x84, 3, 8, 10),
        ],
    );
    let mut strings = HashMap::new();
    strings.insert(0, langid_table());
    strings.insert(1, string_descriptor("Mock Industries"));
    strings.insert(2, string_descriptor("Block Mover"));
    strings.insert(3, string_descriptor("MI-0001"));
    MockDevice {
        device_desc: device_descriptor(0x16c0, 0x05df, 64),
        config_desc: config,
        strings,
        ..MockDevice::default()
    }
}

pub fn controller_with(
    device: MockDevice,
    policy: DevicePolicy,
) -> (HostController<MockHal>, MockHandle) {
    let (hal, handle) = MockHal::new();
    handle.with(|state| state.device = device);
    (HostController::new(hal, policy), handle)
}

/// Tick the machine until it settles in `target` (or panic after `max`
/// ticks).
pub fn run_until(
    controller: &HostController<MockHal>,
    target: DeviceState,
    max: usize,
) -> usize {
    for i in 0..max {
        if controller.device_state() == target {
            return i;
        }
        controller.tick();
    }
    panic!(
        "did not reach {:?} within {} ticks (stuck in {:?})",
        target,
        max,
        controller.device_state()
    );
}

/// Drive the machine to `Ready` against the standard storage device.
pub fn ready_controller() -> (HostController<MockHal>, MockHandle) {
    let (controller, handle) = controller_with(storage_device(), DevicePolicy::default());
    run_until(&controller, DeviceState::Ready, 300);
    (controller, handle)
}

/// The bulk IN / bulk OUT / interrupt IN pipes of [`ready_controller`]'s
/// storage interface.
pub fn storage_pipes(controller: &HostController<MockHal>) -> (PipeId, PipeId, PipeId) {
    let iface = controller.supported_interface(0).expect("no interface");
    assert_eq!(iface.class, 8);
    let mut bulk_in = None;
    let mut bulk_out = None;
    let mut int_in = None;
    for binding in &iface.endpoints {
        match (binding.endpoint_address & 0x80 != 0, binding.ty) {
            (true, usb2hcd::usb::EndpointTy::Bulk) => bulk_in = Some(binding.pipe),
            (false, usb2hcd::usb::EndpointTy::Bulk) => bulk_out = Some(binding.pipe),
            (true, usb2hcd::usb::EndpointTy::Interrupt) => int_in = Some(binding.pipe),
            _ => {}
        }
    }
    (
        bulk_in.expect("bulk IN"),
        bulk_out.expect("bulk OUT"),
        int_in.expect("interrupt IN"),
    )
}

