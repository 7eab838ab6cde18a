//! The 3-phase control-transfer engine.
//!
//! One call executes SETUP, an optional data stage and the status handshake
//! on the default control pipe, with every wait bounded by a frame-count
//! deadline and unwound early by the emergency-exit signal. The SOF
//! interrupt enable state found on entry is restored on every exit path,
//! because the wait loops need SOF interrupts for timeout bookkeeping but the
//! caller may not want them running afterwards.

use log::{trace, warn};

use crate::hal::{BankMode, HostHal, PipeConfig, PipeId, PipeToken, PipeType};
use crate::usb::SetupRequest;

use super::error::{Result, TransferError};
use super::{HostController, CTRL_DATA_TIMEOUT_FRAMES, CTRL_STATUS_TIMEOUT_FRAMES};

/// Data stage of a control transfer.
pub enum ControlData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    NoData,
}

impl ControlData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::NoData => 0,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one poll of a pipe's status flags produced.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PipeEvent {
    Ready,
    Stalled,
    Fault(TransferError),
    Nak,
}

/// Which ready flag a wait is about.
#[derive(Clone, Copy, Debug)]
pub(crate) enum WaitFor {
    SetupSent,
    InReceived,
    OutSent,
}

/// One non-blocking poll step: returns `None` while nothing has happened.
/// STALL and fault flags are acknowledged here; the ready flag is left for
/// the caller to consume together with the FIFO.
pub(crate) fn poll_pipe<H: HostHal>(hal: &mut H, pipe: PipeId, wait: WaitFor) -> Option<PipeEvent> {
    if let Some(fault) = hal.fault(pipe) {
        hal.ack_fault(pipe);
        return Some(PipeEvent::Fault(fault.into()));
    }
    if hal.is_stalled(pipe) {
        hal.ack_stall(pipe);
        return Some(PipeEvent::Stalled);
    }
    if hal.is_nak(pipe) {
        hal.ack_nak(pipe);
        return Some(PipeEvent::Nak);
    }
    let ready = match wait {
        WaitFor::SetupSent => hal.is_setup_sent(pipe),
        WaitFor::InReceived => hal.is_in_received(pipe),
        WaitFor::OutSent => hal.is_out_sent(pipe),
    };
    ready.then_some(PipeEvent::Ready)
}

impl<H: HostHal> HostController<H> {
    /// Execute one control transfer on the default control pipe.
    ///
    /// Returns the number of data-stage bytes actually moved. Any failure
    /// leaves the control pipe reset and frozen; nothing is retried
    /// internally except the hardware's own NAK retries.
    pub fn transfer_control(&self, req: SetupRequest, data: ControlData<'_>) -> Result<usize> {
        let sof_irq_prev = {
            let mut hal = self.hal.lock().unwrap();
            if !hal.is_device_connected() {
                return Err(TransferError::NoDevice);
            }
            let prev = hal.sof_interrupt_enabled();
            hal.set_sof_interrupt(true);
            prev
        };

        let res = self.transfer_control_inner(&req, data);

        let mut hal = self.hal.lock().unwrap();
        if res.is_err() {
            hal.reset_pipe(PipeId::CONTROL);
        } else {
            hal.freeze_pipe(PipeId::CONTROL);
        }
        hal.set_sof_interrupt(sof_irq_prev);
        res
    }

    fn transfer_control_inner(&self, req: &SetupRequest, data: ControlData<'_>) -> Result<usize> {
        let pipe = PipeId::CONTROL;
        let setup = req.setup;
        let low_speed = {
            let hal = self.hal.lock().unwrap();
            hal.is_low_speed()
        };
        let packet_size = usize::from(self.machine.lock().unwrap().ctrl_packet_size);

        // Let the frame in progress drain before queueing the SETUP token.
        self.wait_next_sof(CTRL_DATA_TIMEOUT_FRAMES)?;

        trace!(
            "control pipe: SETUP {:02x} req {:02x} len {}",
            setup.kind,
            setup.request,
            { setup.length },
        );
        {
            let mut hal = self.hal.lock().unwrap();
            hal.set_token(pipe, PipeToken::Setup);
            hal.write_fifo(pipe, &setup.to_bytes());
            hal.unfreeze_pipe(pipe);
        }
        match self.wait_pipe(pipe, WaitFor::SetupSent, CTRL_DATA_TIMEOUT_FRAMES)? {
            PipeEvent::Ready => {
                let mut hal = self.hal.lock().unwrap();
                hal.ack_setup_sent(pipe);
                hal.freeze_pipe(pipe);
            }
            PipeEvent::Stalled => return Err(TransferError::Stall),
            PipeEvent::Fault(err) => return Err(err),
            PipeEvent::Nak => unreachable!("SETUP packets cannot be NAKed"),
        }

        if setup.is_device_to_host() && setup.length > 0 {
            let buf = match data {
                ControlData::In(buf) => buf,
                _ => {
                    warn!("control pipe: IN request without an IN buffer");
                    &mut []
                }
            };
            let requested = usize::from(setup.length).min(buf.len());
            let mut consumed = 0;

            loop {
                // A low-speed link may not have flushed the previous ACK yet;
                // hold the next IN token until the keep-alive went out.
                if low_speed {
                    self.wait_next_sof(CTRL_DATA_TIMEOUT_FRAMES)?;
                }
                {
                    let mut hal = self.hal.lock().unwrap();
                    hal.set_token(pipe, PipeToken::In);
                    hal.unfreeze_pipe(pipe);
                }
                match self.wait_pipe(pipe, WaitFor::InReceived, CTRL_DATA_TIMEOUT_FRAMES)? {
                    PipeEvent::Ready => {}
                    PipeEvent::Stalled => return Err(TransferError::Stall),
                    PipeEvent::Fault(err) => return Err(err),
                    PipeEvent::Nak => continue,
                }
                let received = {
                    let mut hal = self.hal.lock().unwrap();
                    let pending = usize::from(hal.byte_count(pipe));
                    let n = hal.read_fifo(pipe, &mut buf[consumed..(consumed + pending).min(requested)]);
                    hal.ack_in_received(pipe);
                    hal.freeze_pipe(pipe);
                    (n, pending)
                };
                consumed += received.0;
                let short_packet = received.1 < packet_size;
                if short_packet || consumed >= requested || req.incomplete_read {
                    break;
                }
            }

            // Status stage: zero-length OUT.
            {
                let mut hal = self.hal.lock().unwrap();
                hal.set_token(pipe, PipeToken::Out);
                hal.write_fifo(pipe, &[]);
                hal.unfreeze_pipe(pipe);
            }
            loop {
                match self.wait_pipe(pipe, WaitFor::OutSent, CTRL_STATUS_TIMEOUT_FRAMES)? {
                    PipeEvent::Ready => {
                        let mut hal = self.hal.lock().unwrap();
                        hal.ack_out_sent(pipe);
                        break;
                    }
                    PipeEvent::Stalled => return Err(TransferError::Stall),
                    PipeEvent::Fault(err) => return Err(err),
                    PipeEvent::Nak => continue,
                }
            }
            Ok(consumed)
        } else {
            let buf = match data {
                ControlData::Out(buf) => &buf[..buf.len().min(usize::from(setup.length))],
                _ => &[][..],
            };
            let mut sent = 0;
            while sent < buf.len() {
                let chunk = &buf[sent..(sent + packet_size).min(buf.len())];
                {
                    let mut hal = self.hal.lock().unwrap();
                    hal.set_token(pipe, PipeToken::Out);
                    hal.write_fifo(pipe, chunk);
                    hal.unfreeze_pipe(pipe);
                }
                match self.wait_pipe(pipe, WaitFor::OutSent, CTRL_DATA_TIMEOUT_FRAMES)? {
                    PipeEvent::Ready => {
                        let mut hal = self.hal.lock().unwrap();
                        hal.ack_out_sent(pipe);
                        hal.freeze_pipe(pipe);
                        sent += chunk.len();
                    }
                    PipeEvent::Stalled => return Err(TransferError::Stall),
                    PipeEvent::Fault(err) => return Err(err),
                    PipeEvent::Nak => continue,
                }
            }

            // Status stage: zero-length IN from the device.
            if low_speed {
                self.wait_next_sof(CTRL_STATUS_TIMEOUT_FRAMES)?;
            }
            {
                let mut hal = self.hal.lock().unwrap();
                hal.set_token(pipe, PipeToken::In);
                hal.unfreeze_pipe(pipe);
            }
            loop {
                match self.wait_pipe(pipe, WaitFor::InReceived, CTRL_STATUS_TIMEOUT_FRAMES)? {
                    PipeEvent::Ready => {
                        let mut hal = self.hal.lock().unwrap();
                        hal.ack_in_received(pipe);
                        break;
                    }
                    PipeEvent::Stalled => return Err(TransferError::Stall),
                    PipeEvent::Fault(err) => return Err(err),
                    PipeEvent::Nak => continue,
                }
            }
            Ok(sent)
        }
    }

    /// Drive one bounded wait on a pipe flag, polling the emergency-exit
    /// signal and the frame deadline between steps. NAK events terminate the
    /// wait step so the caller can apply its own NAK policy.
    pub(crate) fn wait_pipe(
        &self,
        pipe: PipeId,
        wait: WaitFor,
        budget_frames: u64,
    ) -> Result<PipeEvent> {
        let deadline = {
            let hal = self.hal.lock().unwrap();
            hal.frame_count() + budget_frames
        };
        loop {
            {
                let mut hal = self.hal.lock().unwrap();
                if self.emergency_exit(&hal) {
                    return Err(TransferError::Timeout);
                }
                if let Some(event) = poll_pipe(&mut *hal, pipe, wait) {
                    return Ok(event);
                }
                if hal.frame_count() >= deadline {
                    return Err(TransferError::Timeout);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Busy-wait until the frame counter advances by one (the next SOF or
    /// low-speed keep-alive).
    pub(crate) fn wait_next_sof(&self, budget_frames: u64) -> Result<()> {
        let (start, deadline) = {
            let hal = self.hal.lock().unwrap();
            let now = hal.frame_count();
            (now, now + budget_frames)
        };
        loop {
            {
                let hal = self.hal.lock().unwrap();
                if self.emergency_exit(&hal) {
                    return Err(TransferError::Timeout);
                }
                let now = hal.frame_count();
                if now > start {
                    return Ok(());
                }
                if now >= deadline {
                    return Err(TransferError::Timeout);
                }
            }
            std::thread::yield_now();
        }
    }

    /// (Re)bind the default control pipe to `address` with the given maximum
    /// packet size. Used at enumeration time, once before SET_ADDRESS and
    /// once after the real bMaxPacketSize0 is known.
    pub(crate) fn configure_control_pipe(&self, address: u8, packet_size: u8) {
        self.machine.lock().unwrap().ctrl_packet_size = packet_size;
        let mut hal = self.hal.lock().unwrap();
        hal.configure_pipe(
            PipeId::CONTROL,
            &PipeConfig {
                device_address: address,
                endpoint_address: 0,
                ty: PipeType::Control,
                max_packet_size: u16::from(packet_size),
                banks: BankMode::Single,
                interval: 0,
            },
        );
    }

    /// Read back the configuration value the device believes it is in.
    pub fn get_configuration(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.transfer_control(
            crate::usb::Setup::get_configuration().into(),
            ControlData::In(&mut buf),
        )?;
        Ok(buf[0])
    }

    /// Select an alternate setting on an interface of the active
    /// configuration.
    pub fn set_interface(&self, interface: u8, alternate_setting: u8) -> Result<()> {
        self.transfer_control(
            crate::usb::Setup::set_interface(interface, alternate_setting).into(),
            ControlData::NoData,
        )?;
        Ok(())
    }

    /// Recover a halted endpoint: CLEAR_FEATURE(ENDPOINT_HALT) on the
    /// endpoint bound to `pipe`, then reset the pipe so its data toggle
    /// restarts at DATA0.
    pub fn clear_endpoint_halt(&self, pipe: PipeId) -> Result<()> {
        let endpoint_address = match self.interfaces.lock().unwrap().pipe_state(pipe) {
            Some(state) => state.endpoint_address,
            // No endpoint is bound to this pipe, so there is nothing to
            // recover.
            None => return Err(TransferError::NoDevice),
        };
        self.transfer_control(
            crate::usb::Setup::clear_endpoint_halt(endpoint_address).into(),
            ControlData::NoData,
        )?;
        let mut hal = self.hal.lock().unwrap();
        hal.reset_pipe(pipe);
        Ok(())
    }
}
