//! The attach/enumeration state machine.
//!
//! [`HostController::tick`] advances the single device-state variable once
//! per call. Long operations (descriptor fetches, the second bus reset)
//! happen inside one tick as bounded blocking waits; everything else is a
//! per-tick poll so a disconnected bus can never park the machine: every
//! in-state wait carries a frame deadline, and the emergency-exit signal
//! forces `Unattached` (or `VbusLow`) from any state.

use log::{debug, error, info, warn};

use crate::hal::{HostHal, PipeId};
use crate::usb::{
    ConfigDescriptor, DescriptorKind, DeviceDescriptor, DeviceDescriptorHead, Setup, SetupRequest,
};

use super::control::ControlData;
use super::error::{Result, TransferError};
use super::{
    DeviceState, HostController, DEVICE_ADDRESS, DEVICE_DEFAULT_MAX_ERROR_COUNT,
    SIZEOF_DATA_STAGE, SOF_SETTLE_FRAMES,
};

/// How long a bus reset may take before the machine gives up on the port.
const BUS_RESET_TIMEOUT_FRAMES: u64 = 200;

/// How long the downstream resume handshake may take.
const RESUME_TIMEOUT_FRAMES: u64 = 100;

/// Bus recovery interval after SET_ADDRESS (USB2 9.2.6.3).
const ADDRESS_RECOVERY_FRAMES: u64 = 2;

impl<H: HostHal> HostController<H> {
    /// Advance the enumeration machine by one step. Call periodically from
    /// the scheduler task (or the main loop of a non-RTOS build).
    pub fn tick(&self) {
        if self.emergency.swap(false, std::sync::atomic::Ordering::Relaxed) {
            if self.device_state() != DeviceState::Unattached {
                self.handle_disconnect();
            }
            return;
        }

        let state = self.device_state();

        // A polling build has no interrupt handler to latch the emergency
        // flag, so the connection is re-checked here as well.
        if !matches!(state, DeviceState::Unattached | DeviceState::VbusLow | DeviceState::Error)
            && !self.hal.lock().unwrap().is_device_connected()
        {
            self.handle_disconnect();
            return;
        }

        match state {
            DeviceState::Unattached => self.tick_unattached(),
            DeviceState::VbusLow => self.tick_vbus_low(),
            DeviceState::Attached => self.tick_attached(),
            DeviceState::Powered => self.tick_powered(),
            DeviceState::Default => self.tick_default(),
            DeviceState::Addressed => self.tick_addressed(),
            DeviceState::Configured => self.tick_configured(),
            DeviceState::Ready => {}
            DeviceState::Error => self.tick_error(),
            DeviceState::Unsupported => {}
            DeviceState::Suspended => self.tick_suspended(),
            DeviceState::WaitResume => self.tick_wait_resume(),
        }
    }

    fn set_state(&self, next: DeviceState) {
        let mut machine = self.machine.lock().unwrap();
        if machine.device_state != next {
            debug!("{} -> {}", machine.device_state, next);
            machine.device_state = next;
        }
    }

    fn tick_unattached(&self) {
        let connected = {
            let mut hal = self.hal.lock().unwrap();
            hal.enable_vbus();
            hal.is_vbus_ok() && hal.is_device_connected()
        };
        if connected {
            info!("device attached");
            let mut machine = self.machine.lock().unwrap();
            machine.clear_device();
            machine.device_state = DeviceState::Attached;
        }
    }

    fn tick_vbus_low(&self) {
        if self.hal.lock().unwrap().is_vbus_ok() {
            self.set_state(DeviceState::Unattached);
        }
    }

    /// Issue the bus reset and hold here until the hardware reports it done.
    fn tick_attached(&self) {
        let mut machine = self.machine.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();
        if !machine.reset_issued {
            hal.send_reset();
            hal.start_sof();
            machine.reset_issued = true;
            machine.settle_deadline = Some(hal.frame_count() + BUS_RESET_TIMEOUT_FRAMES);
            return;
        }
        if hal.is_reset_done() {
            machine.reset_issued = false;
            // Keep the bus idle for a settle window before the first
            // transfer; a low-speed device may otherwise look disconnected.
            machine.settle_deadline = Some(hal.frame_count() + SOF_SETTLE_FRAMES);
            machine.device_state = DeviceState::Powered;
        } else if machine
            .settle_deadline
            .map(|d| hal.frame_count() >= d)
            .unwrap_or(false)
        {
            error!("bus reset did not complete");
            machine.device_state = DeviceState::Error;
        }
    }

    fn tick_powered(&self) {
        let mut machine = self.machine.lock().unwrap();
        let hal = self.hal.lock().unwrap();
        if machine
            .settle_deadline
            .map(|d| hal.frame_count() >= d)
            .unwrap_or(true)
        {
            machine.settle_deadline = None;
            machine.device_state = DeviceState::Default;
        }
    }

    /// First contact: learn the control endpoint's real packet size, reset
    /// again for the benefit of noncompliant devices, and assign the address.
    fn tick_default(&self) {
        match self.enumerate_default() {
            Ok(()) => self.set_state(DeviceState::Addressed),
            Err(err) => {
                let mut machine = self.machine.lock().unwrap();
                machine.default_error_count += 1;
                warn!(
                    "default-state enumeration attempt {} failed: {}",
                    machine.default_error_count, err
                );
                if machine.default_error_count > DEVICE_DEFAULT_MAX_ERROR_COUNT {
                    error!("giving up on device after {} attempts", machine.default_error_count);
                    machine.device_state = DeviceState::Error;
                } else {
                    // Retry from the bus reset, like a fresh attachment but
                    // with the error budget preserved.
                    machine.reset_issued = false;
                    machine.device_state = DeviceState::Attached;
                }
            }
        }
    }

    fn enumerate_default(&self) -> Result<()> {
        self.configure_control_pipe(0, 8);
        {
            let mut machine = self.machine.lock().unwrap();
            let hal = self.hal.lock().unwrap();
            machine.low_speed = hal.is_low_speed();
        }

        // One truncated fetch: only the first packet of the descriptor can be
        // trusted before bMaxPacketSize0 is known.
        let len = self.fetch_descriptor(SetupRequest::get_device_descriptor_head())?;
        let head = {
            let machine = self.machine.lock().unwrap();
            *plain::from_bytes::<DeviceDescriptorHead>(&machine.data_stage[..len.min(8)])
                .map_err(|_| TransferError::DataPid)?
        };
        let packet_size = match head.packet_size {
            8 | 16 | 32 | 64 => head.packet_size,
            other => {
                warn!("unlikely bMaxPacketSize0 {}, assuming 8", other);
                8
            }
        };
        debug!("control endpoint packet size {}", packet_size);

        // Some devices only accept SET_ADDRESS on a virgin bus, so reset once
        // more now that the descriptor head has been read.
        {
            let mut hal = self.hal.lock().unwrap();
            hal.send_reset();
        }
        self.wait_reset_done(BUS_RESET_TIMEOUT_FRAMES)?;

        self.configure_control_pipe(0, packet_size);
        self.transfer_control(
            Setup::set_address(u16::from(DEVICE_ADDRESS)).into(),
            ControlData::NoData,
        )?;
        for _ in 0..ADDRESS_RECOVERY_FRAMES {
            self.wait_next_sof(SOF_SETTLE_FRAMES)?;
        }
        self.configure_control_pipe(DEVICE_ADDRESS, packet_size);
        Ok(())
    }

    /// Fetch the full device descriptor and vet the VID/PID.
    fn tick_addressed(&self) {
        match self.enumerate_addressed() {
            Ok(true) => self.set_state(DeviceState::Configured),
            Ok(false) => {
                warn!("device VID/PID not in the registered table");
                self.set_state(DeviceState::Unsupported);
            }
            Err(err) => {
                error!("failed to read the device descriptor: {}", err);
                self.set_state(DeviceState::Error);
            }
        }
    }

    fn enumerate_addressed(&self) -> Result<bool> {
        let len = self.fetch_descriptor(SetupRequest::new(Setup::get_descriptor(
            DescriptorKind::Device,
            0,
            0,
            18,
        )))?;
        {
            let mut machine = self.machine.lock().unwrap();
            let desc = *plain::from_bytes::<DeviceDescriptor>(&machine.data_stage[..len])
                .map_err(|_| TransferError::DataPid)?;
            info!(
                "device descriptor: vid {:04x} pid {:04x} class {}.{} proto {}",
                { desc.vendor },
                { desc.product },
                desc.class,
                desc.sub_class,
                desc.protocol
            );
            machine.dev_desc = Some(desc);
        }
        Ok(self.check_vid_pid() || !self.policy.strict_vid_pid)
    }

    /// Fetch the configuration, run the class check and pipe configuration,
    /// then put the device into the configuration.
    fn tick_configured(&self) {
        match self.enumerate_configured() {
            Ok(true) => {
                info!("device configured and ready");
                self.set_state(DeviceState::Ready);
            }
            Ok(false) => {
                warn!("no interface matched the registered class table");
                self.set_state(DeviceState::Unsupported);
            }
            Err(err) => {
                error!("failed to configure the device: {}", err);
                self.set_state(DeviceState::Error);
            }
        }
    }

    fn enumerate_configured(&self) -> Result<bool> {
        // Header first to learn wTotalLength, then the whole stream, clamped
        // to the descriptor cache.
        let len = self.fetch_descriptor(SetupRequest::new(Setup::get_descriptor(
            DescriptorKind::Configuration,
            0,
            0,
            9,
        )))?;
        let header = {
            let machine = self.machine.lock().unwrap();
            *plain::from_bytes::<ConfigDescriptor>(&machine.data_stage[..len])
                .map_err(|_| TransferError::DataPid)?
        };
        let total = usize::from(header.total_length);
        if total > SIZEOF_DATA_STAGE {
            warn!(
                "configuration descriptor of {} bytes exceeds the {} byte cache, truncating",
                total, SIZEOF_DATA_STAGE
            );
        }
        let total = total.min(SIZEOF_DATA_STAGE).max(9);

        let len = self.fetch_descriptor(SetupRequest::new(Setup::get_descriptor(
            DescriptorKind::Configuration,
            0,
            0,
            total as u16,
        )))?;
        let stream = {
            let mut machine = self.machine.lock().unwrap();
            machine.configuration_value = header.configuration_value;
            machine.data_stage
        };
        let len = len.min(total);

        if !self.check_class(&stream[..len]) {
            return Ok(false);
        }

        self.transfer_control(
            Setup::set_configuration(header.configuration_value).into(),
            ControlData::NoData,
        )?;

        // String fetches are best-effort garnish; a device that stalls them
        // still enumerates.
        if let Err(err) = self.fetch_device_strings() {
            warn!("failed to read string descriptors: {}", err);
        }
        Ok(true)
    }

    fn tick_error(&self) {
        if self.policy.error_restart {
            info!("restarting after error");
            self.handle_disconnect();
        }
    }

    fn tick_suspended(&self) {
        if self.wakeup.swap(false, std::sync::atomic::Ordering::Relaxed) {
            debug!("remote wakeup signalled");
            self.start_resume();
        }
    }

    fn tick_wait_resume(&self) {
        let mut machine = self.machine.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();
        if hal.is_resume_sent() {
            hal.set_sof_interrupt(machine.sof_irq_before_suspend);
            machine.settle_deadline = None;
            machine.device_state = DeviceState::Ready;
            info!("bus resumed");
        } else if machine
            .settle_deadline
            .map(|d| hal.frame_count() >= d)
            .unwrap_or(false)
        {
            error!("resume handshake did not complete");
            machine.device_state = DeviceState::Error;
        }
    }

    /// Suspend the bus. Optionally allows the device to wake it back up with
    /// SET_FEATURE(DEVICE_REMOTE_WAKEUP) first; failure to enable remote
    /// wakeup is reported but does not block the suspend.
    pub fn suspend(&self, enable_remote_wakeup: bool) -> Result<()> {
        if !self.is_ready() {
            return Err(TransferError::NoDevice);
        }
        if enable_remote_wakeup {
            if let Err(err) =
                self.transfer_control(Setup::enable_remote_wakeup().into(), ControlData::NoData)
            {
                warn!("device rejected remote wakeup: {}", err);
            }
        }
        let mut machine = self.machine.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();
        machine.sof_irq_before_suspend = hal.sof_interrupt_enabled();
        hal.stop_sof();
        hal.arm_wakeup_interrupt();
        machine.device_state = DeviceState::Suspended;
        info!("bus suspended");
        Ok(())
    }

    /// Resume a suspended bus from the application side. Returns `false`
    /// when the bus is not suspended.
    pub fn resume(&self) -> bool {
        if self.device_state() != DeviceState::Suspended {
            return false;
        }
        self.start_resume();
        true
    }

    fn start_resume(&self) {
        let mut machine = self.machine.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();
        hal.start_sof();
        hal.send_resume();
        machine.settle_deadline = Some(hal.frame_count() + RESUME_TIMEOUT_FRAMES);
        machine.device_state = DeviceState::WaitResume;
    }

    /// Run a descriptor fetch through the shared data-stage cache. The cache
    /// holds one response at a time; each call overwrites the previous one.
    pub(crate) fn fetch_descriptor(&self, req: SetupRequest) -> Result<usize> {
        let mut cache = [0u8; SIZEOF_DATA_STAGE];
        let len = self.transfer_control(req, ControlData::In(&mut cache[..]))?;
        self.machine.lock().unwrap().data_stage = cache;
        Ok(len)
    }

    fn wait_reset_done(&self, budget_frames: u64) -> Result<()> {
        let deadline = {
            let hal = self.hal.lock().unwrap();
            hal.frame_count() + budget_frames
        };
        loop {
            {
                let hal = self.hal.lock().unwrap();
                if self.emergency_exit(&hal) {
                    return Err(TransferError::Timeout);
                }
                if hal.is_reset_done() {
                    return Ok(());
                }
                if hal.frame_count() >= deadline {
                    return Err(TransferError::Timeout);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Tear down everything device-related and go looking for the next
    /// attachment. Runs on disconnect, VBUS failure and error restart.
    fn handle_disconnect(&self) {
        info!("tearing down device state");
        self.abort_all_jobs();
        {
            let mut interfaces = self.interfaces.lock().unwrap();
            let mut hal = self.hal.lock().unwrap();
            for i in 1..crate::hal::PIPE_COUNT {
                if interfaces.pipes[i].is_some() {
                    hal.disable_pipe(PipeId(i as u8));
                }
            }
            hal.reset_pipe(PipeId::CONTROL);
            interfaces.clear();
        }
        let mut machine = self.machine.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();
        hal.stop_sof();
        machine.clear_device();
        machine.device_state = if hal.is_vbus_ok() {
            DeviceState::Unattached
        } else {
            // Power the rail down until it recovers; `VbusLow` re-enables it
            // on the way back through `Unattached`.
            hal.disable_vbus();
            DeviceState::VbusLow
        };
    }
}
