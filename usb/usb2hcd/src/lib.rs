//! A USB 2.0 Host Controller Driver engine.
//!
//! This crate implements the host-side protocol engine for a single-root-port
//! USB 2.0 controller: it watches for device attachment, drives the chapter-9
//! enumeration sequence (reset, descriptor fetches, addressing,
//! configuration), classifies the device against application-supplied VID/PID
//! and class tables, binds the selected endpoints to hardware pipes, and then
//! moves data over those pipes — as blocking polled calls or as
//! interrupt-driven jobs with completion callbacks.
//!
//! USB consists of three kinds of participants: the Host Controller/Root
//! Hub, USB hubs, and devices. This engine drives the first of those; device
//! classes (mass storage, HID, CDC, ...) are separate consumers layered on
//! top of the pipe API, and register-level access is delegated to a
//! [`hal::HostHal`] implementation supplied by the embedder.
//!
//! This documentation refers directly to the relevant standard:
//!
//! - USB2 - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//!
//! # Concurrency model
//!
//! One foreground caller plus one interrupt handler. The foreground task
//! calls [`host::HostController::tick`] periodically and may issue blocking
//! transfers; the controller's interrupt handler calls
//! [`host::HostController::on_interrupt`]. Asynchronous completion callbacks
//! fire from [`host::HostController::service`], never in interrupt context.

pub mod hal;
pub mod host;
pub mod usb;

pub use hal::{
    BankMode, HostHal, PipeConfig, PipeFault, PipeId, PipeToken, PipeType, UsbEvent, PIPE_COUNT,
};
pub use host::{
    ControlData, DevicePolicy, DeviceState, DeviceSummary, EndpointBinding, HostController,
    JobOutcome, PipeCallback, SupportedInterface, TransferError, MAX_INTERFACE_SUPPORTED,
    SIZEOF_DATA_STAGE,
};
