//! Blocking bulk/interrupt transfers.
//!
//! One packet at a time over an already-configured pipe, with the wait
//! priority order: emergency exit, SOF-delay timeout, pipe error, STALL, NAK
//! budget. NAKs on interrupt-type pipes are the normal "nothing yet" signal
//! and never consume budget.

use log::warn;

use crate::hal::{HostHal, PipeId, PipeToken, PipeType};

use super::control::{poll_pipe, PipeEvent, WaitFor};
use super::error::{Result, TransferError};
use super::{HostController, DATA_DELAY_TIMEOUT_FRAMES, NAK_RECEIVE_BUDGET, NAK_SEND_BUDGET};

impl<H: HostHal> HostController<H> {
    /// Write `buf` to an OUT pipe, one max-packet-sized chunk per bus
    /// transaction.
    pub fn send_data(&self, pipe: PipeId, buf: &[u8]) -> Result<()> {
        let state = match self.interfaces.lock().unwrap().pipe_state(pipe) {
            Some(state) => state,
            None => {
                warn!("send_data on unbound pipe {}", pipe);
                return Err(TransferError::NoDevice);
            }
        };
        let packet_size = usize::from(state.max_packet_size).max(1);
        let mut nak_budget =
            (state.ty != PipeType::Interrupt).then_some(NAK_SEND_BUDGET);

        let sof_irq_prev = self.push_sof_interrupt()?;
        let res = (|| {
            let mut sent = 0;
            while sent < buf.len() {
                let chunk = &buf[sent..(sent + packet_size).min(buf.len())];
                {
                    let mut hal = self.hal.lock().unwrap();
                    hal.set_token(pipe, PipeToken::Out);
                    hal.write_fifo(pipe, chunk);
                    hal.unfreeze_pipe(pipe);
                }
                self.wait_data(pipe, WaitFor::OutSent, &mut nak_budget)?;
                let mut hal = self.hal.lock().unwrap();
                hal.ack_out_sent(pipe);
                hal.freeze_pipe(pipe);
                sent += chunk.len();
            }
            Ok(())
        })();
        self.pop_sof_interrupt(pipe, sof_irq_prev, &res);
        res
    }

    /// Read from an IN pipe into `buf` until a short packet arrives or the
    /// buffer fills; `read` reports the bytes received even on failure.
    pub fn get_data(&self, pipe: PipeId, buf: &mut [u8], read: &mut usize) -> Result<()> {
        let state = match self.interfaces.lock().unwrap().pipe_state(pipe) {
            Some(state) => state,
            None => {
                warn!("get_data on unbound pipe {}", pipe);
                return Err(TransferError::NoDevice);
            }
        };
        let packet_size = usize::from(state.max_packet_size).max(1);
        let mut nak_budget =
            (state.ty != PipeType::Interrupt).then_some(NAK_RECEIVE_BUDGET);
        let low_speed = self.hal.lock().unwrap().is_low_speed();

        *read = 0;
        let sof_irq_prev = self.push_sof_interrupt()?;
        let res = (|| {
            loop {
                // Same quirk as the control engine: on a low-speed link the
                // previous ACK may still be in flight, so hold the next IN
                // token until the keep-alive went out.
                if low_speed && *read > 0 {
                    self.wait_next_sof(DATA_DELAY_TIMEOUT_FRAMES)?;
                }
                {
                    let mut hal = self.hal.lock().unwrap();
                    hal.set_token(pipe, PipeToken::In);
                    hal.unfreeze_pipe(pipe);
                }
                self.wait_data(pipe, WaitFor::InReceived, &mut nak_budget)?;
                let (received, pending) = {
                    let mut hal = self.hal.lock().unwrap();
                    let pending = usize::from(hal.byte_count(pipe));
                    let n = hal.read_fifo(pipe, &mut buf[*read..]);
                    hal.ack_in_received(pipe);
                    hal.freeze_pipe(pipe);
                    (n, pending)
                };
                *read += received;
                if pending < packet_size || *read >= buf.len() {
                    return Ok(());
                }
            }
        })();
        self.pop_sof_interrupt(pipe, sof_irq_prev, &res);
        res
    }

    /// One bounded wait for a data-pipe flag. The SOF-delay deadline resets
    /// per call (i.e. per packet), the NAK budget is carried across the whole
    /// transfer by the caller.
    fn wait_data(&self, pipe: PipeId, wait: WaitFor, nak_budget: &mut Option<u32>) -> Result<()> {
        let delay_deadline = {
            let hal = self.hal.lock().unwrap();
            hal.frame_count() + DATA_DELAY_TIMEOUT_FRAMES
        };
        loop {
            {
                let mut hal = self.hal.lock().unwrap();
                if self.emergency_exit(&hal) {
                    return Err(TransferError::Timeout);
                }
                if hal.frame_count() >= delay_deadline {
                    return Err(TransferError::DelayTimeout);
                }
                match poll_pipe(&mut *hal, pipe, wait) {
                    Some(PipeEvent::Ready) => return Ok(()),
                    Some(PipeEvent::Stalled) => return Err(TransferError::Stall),
                    Some(PipeEvent::Fault(err)) => return Err(err),
                    Some(PipeEvent::Nak) => {
                        if let Some(budget) = nak_budget {
                            if *budget == 0 {
                                return Err(TransferError::NakTimeout);
                            }
                            *budget -= 1;
                        }
                    }
                    None => {}
                }
            }
            std::thread::yield_now();
        }
    }

    fn push_sof_interrupt(&self) -> Result<bool> {
        let mut hal = self.hal.lock().unwrap();
        if !hal.is_device_connected() {
            return Err(TransferError::Timeout);
        }
        let prev = hal.sof_interrupt_enabled();
        hal.set_sof_interrupt(true);
        Ok(prev)
    }

    fn pop_sof_interrupt(&self, pipe: PipeId, prev: bool, res: &Result<()>) {
        let mut hal = self.hal.lock().unwrap();
        if res.is_err() {
            hal.reset_pipe(pipe);
        }
        hal.set_sof_interrupt(prev);
    }
}
