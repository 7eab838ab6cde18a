use thiserror::Error;

use crate::hal::PipeFault;

/// Terminal status of a failed transfer, returned by value from every engine
/// call.
///
/// Control transfers never report `NakTimeout`/`DelayTimeout` (NAKs on the
/// control pipe are retried until the stage timeout fires); data transfers
/// report `NoDevice` only for a pipe no endpoint is bound to. `Abort` is
/// delivered only through asynchronous job callbacks when a disconnect or
/// bus reset tears the job down.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    #[error("data toggle mismatch")]
    DataToggle,
    #[error("bad data PID")]
    DataPid,
    #[error("bad PID")]
    Pid,
    #[error("transfer timed out")]
    Timeout,
    #[error("CRC16 mismatch")]
    Crc16,
    #[error("endpoint stalled")]
    Stall,
    #[error("no device attached")]
    NoDevice,
    #[error("NAK budget exhausted")]
    NakTimeout,
    #[error("no data moved within the delay budget")]
    DelayTimeout,
    #[error("transfer aborted")]
    Abort,
}

impl From<PipeFault> for TransferError {
    fn from(fault: PipeFault) -> Self {
        match fault {
            PipeFault::DataToggle => Self::DataToggle,
            PipeFault::DataPid => Self::DataPid,
            PipeFault::Pid => Self::Pid,
            PipeFault::Timeout => Self::Timeout,
            PipeFault::Crc16 => Self::Crc16,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
