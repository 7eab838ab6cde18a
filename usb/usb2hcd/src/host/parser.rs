//! Enumeration-time descriptor matching.
//!
//! `check_vid_pid` vets the device against the registered VID/PID groups;
//! `check_class` walks the configuration descriptor stream, fills the
//! supported-interface table from the class table, and (when enabled)
//! allocates and configures one hardware pipe per endpoint of each matched
//! interface.

use log::{debug, trace, warn};
use smallvec::SmallVec;

use crate::hal::{BankMode, HostHal, PipeConfig, PipeType};
use crate::usb::{DescriptorKind, EndpointDescriptor, EndpointTy, InterfaceDescriptor};

use super::{
    EndpointBinding, HostController, InterfaceTable, PipeState, SupportedInterface, DEVICE_ADDRESS,
};

fn decode<T: plain::Plain + Copy>(record: &[u8]) -> Option<T> {
    plain::from_bytes::<T>(record).ok().copied()
}

fn pipe_type(ty: EndpointTy) -> PipeType {
    match ty {
        EndpointTy::Ctrl => PipeType::Control,
        EndpointTy::Isoch => PipeType::Isochronous,
        EndpointTy::Bulk => PipeType::Bulk,
        EndpointTy::Interrupt => PipeType::Interrupt,
    }
}

/// A matched interface whose endpoint records are still being consumed.
struct Collecting {
    entry: SupportedInterface,
    endpoints_remaining: u8,
    valid: bool,
}

impl<H: HostHal> HostController<H> {
    /// Whether the enumerated device's VID/PID appears in the registered
    /// device table.
    pub fn check_vid_pid(&self) -> bool {
        let machine = self.machine.lock().unwrap();
        match machine.dev_desc {
            Some(desc) => self.policy.contains_vid_pid(desc.vendor, desc.product),
            None => false,
        }
    }

    /// Walk a full configuration descriptor stream, record every interface
    /// the class table accepts (up to the table capacity) and bind its
    /// endpoints to hardware pipes. Returns whether anything matched.
    pub fn check_class(&self, config: &[u8]) -> bool {
        let mut interfaces = self.interfaces.lock().unwrap();
        let mut hook = self.descriptor_hook.lock().unwrap();
        let mut hal = self.hal.lock().unwrap();

        let mut collecting: Option<Collecting> = None;
        let mut offset = 0;

        while offset + 2 <= config.len() {
            let dlen = usize::from(config[offset]);
            if dlen < 2 || offset + dlen > config.len() {
                warn!("malformed descriptor record at offset {}", offset);
                break;
            }
            let kind = config[offset + 1];
            let record = &config[offset..offset + dlen];
            if let Some(hook) = hook.as_mut() {
                hook(kind, record);
            }

            if kind == DescriptorKind::Interface as u8 {
                if let Some(done) = collecting.take() {
                    Self::flush_interface(&mut interfaces, &mut *hal, done);
                }
                if interfaces.is_full() {
                    debug!("interface table full, stopping configuration scan");
                    break;
                }
                collecting = self.match_interface(record);
            } else if kind == DescriptorKind::Endpoint as u8 {
                if let Some(c) = &mut collecting {
                    if c.endpoints_remaining > 0 {
                        self.bind_endpoint(&mut interfaces, &mut *hal, c, record);
                    }
                }
            }

            offset += dlen;
        }
        if let Some(done) = collecting.take() {
            Self::flush_interface(&mut interfaces, &mut *hal, done);
        }

        !interfaces.entries.is_empty()
    }

    fn match_interface(&self, record: &[u8]) -> Option<Collecting> {
        let desc: InterfaceDescriptor = decode(record)?;
        let entry = self
            .policy
            .matching_class(desc.class, desc.sub_class, desc.protocol)?;
        debug!(
            "interface {} alt {} matches class table entry \"{}\" ({}.{} proto {})",
            desc.number,
            desc.alternate_setting,
            entry.name,
            desc.class,
            desc.sub_class,
            desc.protocol
        );
        Some(Collecting {
            entry: SupportedInterface {
                number: desc.number,
                alternate_setting: desc.alternate_setting,
                class: desc.class,
                sub_class: desc.sub_class,
                protocol: desc.protocol,
                endpoints: SmallVec::new(),
            },
            endpoints_remaining: desc.endpoints,
            valid: true,
        })
    }

    fn bind_endpoint(
        &self,
        interfaces: &mut InterfaceTable,
        hal: &mut H,
        collecting: &mut Collecting,
        record: &[u8],
    ) {
        let Some(desc) = decode::<EndpointDescriptor>(record) else {
            warn!("truncated endpoint descriptor record");
            collecting.valid = false;
            return;
        };
        if !self.policy.auto_config_endpoints {
            collecting.endpoints_remaining -= 1;
            return;
        }

        let size = desc.packet_size();
        let ty = desc.ty();
        let Some(pipe) = interfaces.alloc_pipe(&*hal, size) else {
            warn!("out of pipes for endpoint {:02x}", { desc.address });
            collecting.valid = false;
            return;
        };
        if hal.pipe_capacity(pipe) < size {
            warn!(
                "endpoint {:02x} packet size {} exceeds every free pipe, putting it on pipe {}",
                { desc.address },
                size,
                pipe
            );
        }
        hal.configure_pipe(
            pipe,
            &PipeConfig {
                device_address: DEVICE_ADDRESS,
                endpoint_address: desc.address,
                ty: pipe_type(ty),
                max_packet_size: size,
                // Bulk pipes run single-banked; everything else gets the
                // second bank for back-to-back packets.
                banks: if ty == EndpointTy::Bulk {
                    BankMode::Single
                } else {
                    BankMode::Double
                },
                interval: desc.interval,
            },
        );
        interfaces.pipes[pipe.index()] = Some(PipeState {
            ty: pipe_type(ty),
            endpoint_address: desc.address,
            max_packet_size: size,
        });
        trace!(
            "endpoint {:02x} ({:?}, {} bytes, {}) -> pipe {}",
            { desc.address },
            ty,
            size,
            if desc.is_in() { "IN" } else { "OUT" },
            pipe
        );
        collecting.entry.endpoints.push(EndpointBinding {
            endpoint_address: desc.address,
            pipe,
            ty,
            max_packet_size: size,
        });
        collecting.endpoints_remaining -= 1;
    }

    /// Commit a fully-collected interface, or roll back its pipes if the
    /// stream moved on while endpoint records were still expected (malformed
    /// or partial descriptors).
    fn flush_interface(interfaces: &mut InterfaceTable, hal: &mut H, collecting: Collecting) {
        if collecting.valid && collecting.endpoints_remaining == 0 {
            interfaces.entries.push(collecting.entry);
        } else {
            warn!(
                "interface {} dropped: {} endpoint descriptor(s) missing",
                collecting.entry.number, collecting.endpoints_remaining
            );
            for binding in &collecting.entry.endpoints {
                hal.disable_pipe(binding.pipe);
                interfaces.pipes[binding.pipe.index()] = None;
            }
        }
    }
}
