//! Interrupt-driven per-pipe transfer jobs.
//!
//! Arming a job primes the first packet and returns immediately; everything
//! else happens when the interrupt handler calls [`HostController::on_interrupt`].
//! The handler does only the register-level decode and job advance inside the
//! engine's critical sections, then pushes terminal completions onto a
//! single-producer/single-consumer channel. Callbacks run later, in whatever
//! foreground context calls [`HostController::service`] — never in interrupt
//! context.

use log::{debug, trace, warn};

use crate::hal::{HostHal, PipeId, PipeToken, PipeType, UsbEvent, PIPE_COUNT};

use super::error::TransferError;
use super::{HostController, DATA_DELAY_TIMEOUT_FRAMES, NAK_RECEIVE_BUDGET, NAK_SEND_BUDGET};

/// Terminal result of one asynchronous job, handed to its callback.
#[derive(Debug)]
pub struct JobOutcome {
    pub status: Result<(), TransferError>,
    /// Payload bytes that actually moved before the job retired.
    pub bytes_transferred: usize,
    /// The job's buffer: the data received (truncated to
    /// `bytes_transferred`) for IN jobs, the original payload for OUT jobs.
    pub data: Vec<u8>,
}

pub type PipeCallback = Box<dyn FnOnce(PipeId, JobOutcome) + Send>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum JobDir {
    In,
    Out,
}

pub(crate) struct PipeJob {
    dir: JobDir,
    packet_size: usize,
    buf: Vec<u8>,
    /// Total bytes this job wants to move.
    requested: usize,
    processed: usize,
    /// OUT only: bytes sitting in the FIFO awaiting the ack.
    in_flight: usize,
    nak_budget: Option<u32>,
    /// Frame by which something must have moved, refreshed on every packet.
    delay_deadline: u64,
    callback: Option<PipeCallback>,
}

/// Slot lifecycle: `Armed` until the ISR retires the job, `Finishing` while
/// its completion sits in the queue, `Idle` once the callback has fired.
pub(crate) enum Slot {
    Idle,
    Armed(PipeJob),
    Finishing,
}

impl Slot {
    fn is_idle(&self) -> bool {
        matches!(self, Slot::Idle)
    }
}

pub(crate) struct JobTable {
    pub slots: [Slot; PIPE_COUNT],
    pub armed: usize,
    /// SOF interrupt enable state saved when the first job armed, restored
    /// when the last one retires.
    pub sof_irq_prev: bool,
}

impl Default for JobTable {
    fn default() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::Idle),
            armed: 0,
            sof_irq_prev: false,
        }
    }
}

pub(crate) struct Completion {
    pipe: PipeId,
    status: Result<(), TransferError>,
    job: PipeJob,
}

impl<H: HostHal> HostController<H> {
    /// Arm an asynchronous OUT transfer. Returns `false`, leaving any
    /// in-flight job untouched, if the pipe is busy or not bound to an
    /// endpoint.
    pub fn send_data_async(
        &self,
        pipe: PipeId,
        data: Vec<u8>,
        on_done: impl FnOnce(PipeId, JobOutcome) + Send + 'static,
    ) -> bool {
        self.arm_job(pipe, JobDir::Out, data.len(), data, Box::new(on_done))
    }

    /// Arm an asynchronous IN transfer for up to `len` bytes. Returns `false`
    /// if the pipe is busy or not bound to an endpoint.
    pub fn get_data_async(
        &self,
        pipe: PipeId,
        len: usize,
        on_done: impl FnOnce(PipeId, JobOutcome) + Send + 'static,
    ) -> bool {
        self.arm_job(pipe, JobDir::In, len, vec![0; len], Box::new(on_done))
    }

    fn arm_job(
        &self,
        pipe: PipeId,
        dir: JobDir,
        requested: usize,
        buf: Vec<u8>,
        callback: PipeCallback,
    ) -> bool {
        let state = match self.interfaces.lock().unwrap().pipe_state(pipe) {
            Some(state) => state,
            None => {
                warn!("async transfer on unbound pipe {}", pipe);
                return false;
            }
        };

        let mut jobs = self.jobs.lock().unwrap();
        if !jobs.slots[pipe.index()].is_idle() {
            debug!("pipe {} busy, rejecting new job", pipe);
            return false;
        }

        let mut hal = self.hal.lock().unwrap();
        let with_nak = state.ty != PipeType::Interrupt;
        let nak_budget = with_nak.then_some(match dir {
            JobDir::Out => NAK_SEND_BUDGET,
            JobDir::In => NAK_RECEIVE_BUDGET,
        });
        let packet_size = usize::from(state.max_packet_size).max(1);

        let mut job = PipeJob {
            dir,
            packet_size,
            buf,
            requested,
            processed: 0,
            in_flight: 0,
            nak_budget,
            delay_deadline: hal.frame_count() + DATA_DELAY_TIMEOUT_FRAMES,
            callback: Some(callback),
        };

        hal.reset_pipe(pipe);
        match dir {
            JobDir::Out => {
                let chunk_len = job.requested.min(packet_size);
                hal.set_token(pipe, PipeToken::Out);
                hal.write_fifo(pipe, &job.buf[..chunk_len]);
                job.in_flight = chunk_len;
            }
            JobDir::In => {
                hal.set_token(pipe, PipeToken::In);
            }
        }
        hal.enable_pipe_interrupts(pipe, with_nak);
        hal.unfreeze_pipe(pipe);

        if jobs.armed == 0 {
            jobs.sof_irq_prev = hal.sof_interrupt_enabled();
            hal.set_sof_interrupt(true);
        }
        jobs.armed += 1;
        jobs.slots[pipe.index()] = Slot::Armed(job);
        trace!("armed {:?} job on pipe {}", dir, pipe);
        true
    }

    /// The shared interrupt entry point. Call from the controller's interrupt
    /// handler (or from a polling loop standing in for one). Decodes pending
    /// device-level events, advances every pipe with a pending flag, and
    /// queues terminal completions for [`Self::service`].
    pub fn on_interrupt(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();

        let events = hal.take_events();
        if events.intersects(UsbEvent::DISCONNECTION | UsbEvent::VBUS_ERROR) {
            self.emergency.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        if events.contains(UsbEvent::WAKEUP) {
            self.wakeup.store(true, std::sync::atomic::Ordering::Relaxed);
        }

        if events.contains(UsbEvent::SOF) {
            let now = hal.frame_count();
            for i in 0..PIPE_COUNT {
                let expired = matches!(
                    &jobs.slots[i],
                    Slot::Armed(job) if now >= job.delay_deadline
                );
                if expired {
                    Self::finish_job(
                        &mut jobs,
                        &mut hal,
                        &self.completions_tx,
                        PipeId(i as u8),
                        Err(TransferError::DelayTimeout),
                    );
                }
            }
        }

        let mask = hal.pipe_interrupt_mask();
        for i in 0..PIPE_COUNT {
            if mask & (1 << i) != 0 {
                self.advance_job(&mut jobs, &mut hal, PipeId(i as u8));
            }
        }
    }

    /// Advance the armed job on `pipe` by one hardware event.
    fn advance_job(&self, jobs: &mut JobTable, hal: &mut H, pipe: PipeId) {
        if !matches!(jobs.slots[pipe.index()], Slot::Armed(_)) {
            return;
        }

        if let Some(fault) = hal.fault(pipe) {
            hal.ack_fault(pipe);
            Self::finish_job(jobs, hal, &self.completions_tx, pipe, Err(fault.into()));
            return;
        }
        if hal.is_stalled(pipe) {
            hal.ack_stall(pipe);
            Self::finish_job(
                jobs,
                hal,
                &self.completions_tx,
                pipe,
                Err(TransferError::Stall),
            );
            return;
        }
        if hal.is_nak(pipe) {
            hal.ack_nak(pipe);
            // NAK is business as usual on interrupt pipes; elsewhere it eats
            // into the job's budget.
            let exhausted = {
                let Slot::Armed(job) = &mut jobs.slots[pipe.index()] else {
                    return;
                };
                match &mut job.nak_budget {
                    Some(0) => true,
                    Some(budget) => {
                        *budget -= 1;
                        false
                    }
                    None => false,
                }
            };
            if exhausted {
                Self::finish_job(
                    jobs,
                    hal,
                    &self.completions_tx,
                    pipe,
                    Err(TransferError::NakTimeout),
                );
            }
            return;
        }

        let done = {
            let Slot::Armed(job) = &mut jobs.slots[pipe.index()] else {
                return;
            };
            match job.dir {
                JobDir::In if hal.is_in_received(pipe) => {
                    let pending = usize::from(hal.byte_count(pipe));
                    let end = job.requested.min(job.processed + pending);
                    let n = hal.read_fifo(pipe, &mut job.buf[job.processed..end]);
                    hal.ack_in_received(pipe);
                    job.processed += n;
                    job.delay_deadline = hal.frame_count() + DATA_DELAY_TIMEOUT_FRAMES;
                    if pending < job.packet_size || job.processed >= job.requested {
                        true
                    } else {
                        hal.unfreeze_pipe(pipe);
                        false
                    }
                }
                JobDir::Out if hal.is_out_sent(pipe) => {
                    hal.ack_out_sent(pipe);
                    job.processed += job.in_flight;
                    job.in_flight = 0;
                    job.delay_deadline = hal.frame_count() + DATA_DELAY_TIMEOUT_FRAMES;
                    if job.processed >= job.requested {
                        true
                    } else {
                        let chunk = &job.buf
                            [job.processed..(job.processed + job.packet_size).min(job.requested)];
                        hal.write_fifo(pipe, chunk);
                        job.in_flight = chunk.len();
                        hal.unfreeze_pipe(pipe);
                        false
                    }
                }
                _ => false,
            }
        };
        if done {
            Self::finish_job(jobs, hal, &self.completions_tx, pipe, Ok(()));
        }
    }

    /// Retire the armed job on `pipe`: disarm the hardware, queue the
    /// completion, and hand SOF-interrupt control back once no job remains.
    fn finish_job(
        jobs: &mut JobTable,
        hal: &mut H,
        completions: &crossbeam_channel::Sender<Completion>,
        pipe: PipeId,
        status: Result<(), TransferError>,
    ) {
        let job = match std::mem::replace(&mut jobs.slots[pipe.index()], Slot::Finishing) {
            Slot::Armed(job) => job,
            other => {
                jobs.slots[pipe.index()] = other;
                return;
            }
        };
        hal.disable_pipe_interrupts(pipe);
        if status.is_err() {
            hal.reset_pipe(pipe);
        } else {
            hal.freeze_pipe(pipe);
        }
        jobs.armed -= 1;
        if jobs.armed == 0 {
            hal.set_sof_interrupt(jobs.sof_irq_prev);
        }
        trace!("pipe {} job retired: {:?}", pipe, status);
        // The channel is unbounded; send only fails when the controller is
        // being dropped, and then there is nobody left to call back.
        let _ = completions.send(Completion { pipe, status, job });
    }

    /// Deliver the callbacks of every retired job. Returns how many fired.
    pub fn service(&self) -> usize {
        let mut delivered = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            let Completion { pipe, status, mut job } = completion;
            {
                let mut jobs = self.jobs.lock().unwrap();
                jobs.slots[pipe.index()] = Slot::Idle;
            }
            let mut data = std::mem::take(&mut job.buf);
            if job.dir == JobDir::In {
                data.truncate(job.processed);
            }
            if let Some(callback) = job.callback.take() {
                callback(
                    pipe,
                    JobOutcome {
                        status,
                        bytes_transferred: job.processed,
                        data,
                    },
                );
                delivered += 1;
            }
        }
        delivered
    }

    /// Disarm every pipe job and invoke each callback synchronously with an
    /// aborted status. Completions already queued by the interrupt handler
    /// are delivered first with their real status, so every armed job's
    /// callback fires exactly once. A no-op when nothing is armed.
    pub fn abort_all_jobs(&self) {
        self.service();

        let mut aborted = Vec::new();
        {
            let mut jobs = self.jobs.lock().unwrap();
            let mut hal = self.hal.lock().unwrap();
            for i in 0..PIPE_COUNT {
                if let Slot::Armed(_) = jobs.slots[i] {
                    let pipe = PipeId(i as u8);
                    if let Slot::Armed(job) =
                        std::mem::replace(&mut jobs.slots[i], Slot::Idle)
                    {
                        hal.disable_pipe_interrupts(pipe);
                        hal.reset_pipe(pipe);
                        jobs.armed -= 1;
                        aborted.push((pipe, job));
                    }
                }
            }
            if !aborted.is_empty() && jobs.armed == 0 {
                hal.set_sof_interrupt(jobs.sof_irq_prev);
            }
        }

        for (pipe, mut job) in aborted {
            debug!("aborting job on pipe {}", pipe);
            let mut data = std::mem::take(&mut job.buf);
            if job.dir == JobDir::In {
                data.truncate(job.processed);
            }
            if let Some(callback) = job.callback.take() {
                callback(
                    pipe,
                    JobOutcome {
                        status: Err(TransferError::Abort),
                        bytes_transferred: job.processed,
                        data,
                    },
                );
            }
        }
    }
}
