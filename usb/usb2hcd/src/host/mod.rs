//! The host-side protocol engine.
//!
//! One [`HostController`] owns everything a single root port needs: the HAL
//! handle, the enumeration state machine, the supported-interface table and
//! the asynchronous pipe jobs. The engine is built for exactly one foreground
//! caller plus one interrupt handler; every shared structure sits behind its
//! own mutex and is only ever locked for short read-modify-write sections,
//! never across a wait loop.
//!
//! Lock order, outermost first: `machine`, `interfaces`, `jobs`, `hal`; the
//! HAL lock is innermost because every wait loop takes and releases it once
//! per poll step.

use std::fmt;
use std::result;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use smallvec::SmallVec;

use crate::hal::{HostHal, PipeId, PipeType, PIPE_COUNT};
use crate::usb::{DeviceDescriptor, EndpointTy};

pub use self::config::{ClassEntry, DeviceEntry, DevicePolicy};
pub use self::control::ControlData;
pub use self::error::TransferError;
pub use self::jobs::{JobOutcome, PipeCallback};

use self::jobs::{Completion, JobTable};

pub mod config;
pub mod error;

mod control;
mod enumeration;
mod jobs;
mod parser;
mod strings;
mod transfer;

/// Capacity of the shared descriptor cache every control-transfer data stage
/// lands in during enumeration. Configuration descriptors longer than this
/// are fetched truncated.
pub const SIZEOF_DATA_STAGE: usize = 512;

/// Upper bound on entries in the supported-interface table. The parser stops
/// scanning, without erroring, once the table is full.
pub const MAX_INTERFACE_SUPPORTED: usize = 4;

/// Address assigned to the attached device by SET_ADDRESS. A single root
/// port without hub support never needs more than one.
pub(crate) const DEVICE_ADDRESS: u8 = 1;

/// Retry budget for the truncated descriptor fetch in `Default`; slow or
/// noncompliant devices get this many bus-reset-and-retry rounds.
pub const DEVICE_DEFAULT_MAX_ERROR_COUNT: u8 = 4;

/// Frames to wait after reset before the first control transfer, and the
/// window during which SOF must keep arriving for the connection to count as
/// stable (guards against low-speed false disconnects).
pub const SOF_SETTLE_FRAMES: u64 = 100;

/// Stage timeouts for control transfers, in frames (≈1 ms each).
pub const CTRL_DATA_TIMEOUT_FRAMES: u64 = 1_000;
pub const CTRL_STATUS_TIMEOUT_FRAMES: u64 = 2_000;

/// Frames without any data movement before a synchronous or asynchronous
/// data transfer gives up with `DelayTimeout`.
pub const DATA_DELAY_TIMEOUT_FRAMES: u64 = 2_000;

/// NAK budgets for the synchronous and asynchronous data engines. Distinct
/// because an OUT NAK means "busy" while an IN NAK usually means "nothing to
/// send yet". Interrupt-type pipes never consume NAK budget.
pub const NAK_SEND_BUDGET: u32 = 100;
pub const NAK_RECEIVE_BUDGET: u32 = 300;

/// Lifecycle of the one device behind the root port. Exactly one instance,
/// mutated only by the enumeration machine.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Unattached,
    /// VBUS is out of range; wait for it to recover.
    VbusLow,
    Attached,
    Powered,
    Default,
    Addressed,
    Configured,
    Ready,
    Error,
    Unsupported,
    Suspended,
    WaitResume,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unattached => "unattached",
            Self::VbusLow => "vbus_low",
            Self::Attached => "attached",
            Self::Powered => "powered",
            Self::Default => "default",
            Self::Addressed => "addressed",
            Self::Configured => "configured",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Unsupported => "unsupported",
            Self::Suspended => "suspended",
            Self::WaitResume => "wait_resume",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid input")]
pub struct Invalid(pub &'static str);

impl str::FromStr for DeviceState {
    type Err = Invalid;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        Ok(match s {
            "unattached" => Self::Unattached,
            "vbus_low" => Self::VbusLow,
            "attached" => Self::Attached,
            "powered" => Self::Powered,
            "default" => Self::Default,
            "addressed" => Self::Addressed,
            "configured" => Self::Configured,
            "ready" => Self::Ready,
            "error" => Self::Error,
            "unsupported" => Self::Unsupported,
            "suspended" => Self::Suspended,
            "wait_resume" => Self::WaitResume,
            _ => return Err(Invalid("read unknown device state")),
        })
    }
}

/// One endpoint of a supported interface, bound to its hardware pipe.
#[derive(Clone, Copy, Debug)]
pub struct EndpointBinding {
    /// Endpoint address byte, direction bit included.
    pub endpoint_address: u8,
    pub pipe: PipeId,
    pub ty: EndpointTy,
    pub max_packet_size: u16,
}

/// One interface the class table matched during enumeration, with its
/// endpoint-to-pipe mapping. Built once per enumeration pass, cleared on
/// disconnect.
#[derive(Clone, Debug)]
pub struct SupportedInterface {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub endpoints: SmallVec<[EndpointBinding; 4]>,
}

/// What the engine knows about one allocated hardware pipe.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PipeState {
    pub ty: PipeType,
    pub endpoint_address: u8,
    pub max_packet_size: u16,
}

#[derive(Default)]
pub(crate) struct InterfaceTable {
    pub entries: Vec<SupportedInterface>,
    pub pipes: [Option<PipeState>; PIPE_COUNT],
}

impl InterfaceTable {
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pipes = [None; PIPE_COUNT];
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_INTERFACE_SUPPORTED
    }

    /// Pick a free pipe for an endpoint of `size` bytes: the lowest-numbered
    /// pipe whose FIFO fits the packet, or the roomiest free pipe when the
    /// endpoint is larger than anything available. Pipe 0 stays reserved for
    /// the default control pipe.
    pub fn alloc_pipe<H: HostHal>(&self, hal: &H, size: u16) -> Option<PipeId> {
        let free = (1..PIPE_COUNT as u8)
            .map(PipeId)
            .filter(|p| self.pipes[p.index()].is_none());

        let mut largest: Option<(PipeId, u16)> = None;
        for pipe in free {
            let capacity = hal.pipe_capacity(pipe);
            if capacity >= size {
                return Some(pipe);
            }
            if largest.map(|(_, c)| capacity > c).unwrap_or(true) {
                largest = Some((pipe, capacity));
            }
        }
        largest.map(|(pipe, _)| pipe)
    }

    pub fn pipe_state(&self, pipe: PipeId) -> Option<PipeState> {
        self.pipes.get(pipe.index()).copied().flatten()
    }
}

/// Enumeration bookkeeping plus the shared descriptor cache. Touched only by
/// the thread driving `tick()`; the mutex exists for the ISR's disconnect
/// path, not for concurrent enumeration.
pub(crate) struct MachineState {
    pub device_state: DeviceState,
    pub default_error_count: u8,
    /// Frame by which the current in-state wait (reset settle, resume
    /// handshake) must have finished.
    pub settle_deadline: Option<u64>,
    pub reset_issued: bool,
    pub low_speed: bool,
    /// Current max packet size of the default control pipe. Starts at 8 until
    /// the truncated descriptor fetch reports the real value.
    pub ctrl_packet_size: u8,
    pub dev_desc: Option<DeviceDescriptor>,
    pub configuration_value: u8,
    pub lang_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial: Option<String>,
    /// Whether SOF interrupts were enabled before suspend, restored on resume.
    pub sof_irq_before_suspend: bool,
    /// The shared single-buffered descriptor cache: each control transfer of
    /// the enumeration machine overwrites it, so callers extract what they
    /// need before issuing the next request.
    pub data_stage: [u8; SIZEOF_DATA_STAGE],
}

impl MachineState {
    fn new() -> Self {
        Self {
            device_state: DeviceState::Unattached,
            default_error_count: 0,
            settle_deadline: None,
            reset_issued: false,
            low_speed: false,
            ctrl_packet_size: 8,
            dev_desc: None,
            configuration_value: 0,
            lang_id: None,
            manufacturer: None,
            product_name: None,
            serial: None,
            sof_irq_before_suspend: false,
            data_stage: [0; SIZEOF_DATA_STAGE],
        }
    }

    /// Forget everything learned about the device. Called on disconnect and
    /// on restart out of `Error`.
    pub fn clear_device(&mut self) {
        self.default_error_count = 0;
        self.settle_deadline = None;
        self.reset_issued = false;
        self.low_speed = false;
        self.ctrl_packet_size = 8;
        self.dev_desc = None;
        self.configuration_value = 0;
        self.lang_id = None;
        self.manufacturer = None;
        self.product_name = None;
        self.serial = None;
    }
}

/// Summary of the enumerated device, available once the machine reaches
/// `Ready`.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceSummary {
    pub vendor: u16,
    pub product: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub low_speed: bool,
    pub configuration_value: u8,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial: Option<String>,
}

pub(crate) type DescriptorHook = Box<dyn FnMut(u8, &[u8]) + Send>;

/// The engine context for one root port.
pub struct HostController<H: HostHal> {
    pub(crate) hal: Mutex<H>,
    pub(crate) machine: Mutex<MachineState>,
    pub(crate) interfaces: Mutex<InterfaceTable>,
    pub(crate) jobs: Mutex<JobTable>,
    pub(crate) policy: DevicePolicy,
    pub(crate) descriptor_hook: Mutex<Option<DescriptorHook>>,
    /// Latched by the interrupt handler on disconnect or VBUS failure; the
    /// only cancellation signal. Every blocking wait polls it.
    pub(crate) emergency: AtomicBool,
    /// Latched by the interrupt handler on upstream resume signalling.
    pub(crate) wakeup: AtomicBool,
    pub(crate) completions_tx: Sender<Completion>,
    pub(crate) completions_rx: Receiver<Completion>,
}

impl<H: HostHal> HostController<H> {
    pub fn new(hal: H, policy: DevicePolicy) -> Self {
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        Self {
            hal: Mutex::new(hal),
            machine: Mutex::new(MachineState::new()),
            interfaces: Mutex::new(InterfaceTable::default()),
            jobs: Mutex::new(JobTable::default()),
            policy,
            descriptor_hook: Mutex::new(None),
            emergency: AtomicBool::new(false),
            wakeup: AtomicBool::new(false),
            completions_tx,
            completions_rx,
        }
    }

    /// Register a hook that sees every record of the configuration
    /// descriptor during enumeration, including the ones the core does not
    /// understand (class-specific descriptors, audio formats, ...).
    ///
    /// The hook runs inside the parser's critical section and must not call
    /// back into the controller.
    pub fn on_descriptor(&self, hook: DescriptorHook) {
        *self.descriptor_hook.lock().unwrap() = Some(hook);
    }

    pub fn device_state(&self) -> DeviceState {
        self.machine.lock().unwrap().device_state
    }

    /// Transfers are permitted exactly in `Ready`.
    pub fn is_ready(&self) -> bool {
        self.device_state() == DeviceState::Ready
    }

    pub fn is_suspended(&self) -> bool {
        matches!(
            self.device_state(),
            DeviceState::Suspended | DeviceState::WaitResume
        )
    }

    pub fn vid(&self) -> Option<u16> {
        self.machine.lock().unwrap().dev_desc.map(|d| d.vendor)
    }

    pub fn pid(&self) -> Option<u16> {
        self.machine.lock().unwrap().dev_desc.map(|d| d.product)
    }

    pub fn num_supported_interfaces(&self) -> usize {
        self.interfaces.lock().unwrap().entries.len()
    }

    pub fn supported_interface(&self, index: usize) -> Option<SupportedInterface> {
        self.interfaces.lock().unwrap().entries.get(index).cloned()
    }

    pub fn interface_class(&self, index: usize) -> Option<u8> {
        self.supported_interface(index).map(|i| i.class)
    }

    pub fn interface_subclass(&self, index: usize) -> Option<u8> {
        self.supported_interface(index).map(|i| i.sub_class)
    }

    pub fn interface_protocol(&self, index: usize) -> Option<u8> {
        self.supported_interface(index).map(|i| i.protocol)
    }

    /// The hardware pipe bound to endpoint `ep` (by position, not address) of
    /// supported interface `index`.
    pub fn interface_pipe(&self, index: usize, ep: usize) -> Option<PipeId> {
        self.supported_interface(index)
            .and_then(|i| i.endpoints.get(ep).map(|b| b.pipe))
    }

    pub fn device_summary(&self) -> Option<DeviceSummary> {
        let machine = self.machine.lock().unwrap();
        let desc = machine.dev_desc?;
        Some(DeviceSummary {
            vendor: desc.vendor,
            product: desc.product,
            class: desc.class,
            sub_class: desc.sub_class,
            protocol: desc.protocol,
            low_speed: machine.low_speed,
            configuration_value: machine.configuration_value,
            manufacturer: machine.manufacturer.clone(),
            product_name: machine.product_name.clone(),
            serial: machine.serial.clone(),
        })
    }

    /// Whether an asynchronous disconnect or VBUS failure requires every
    /// in-progress wait to unwind.
    pub(crate) fn emergency_exit(&self, hal: &H) -> bool {
        self.emergency.load(Ordering::Relaxed) || !hal.is_device_connected()
    }
}
