//! String descriptor fetching.
//!
//! Strings ride on the same control engine as everything else: index 0 is
//! the LANGID table, every other index a UTF-16LE payload in the language
//! the host picked (USB2 9.6.7).

use log::warn;

use crate::hal::HostHal;
use crate::usb::{DescriptorKind, Setup};

use super::control::ControlData;
use super::error::Result;
use super::HostController;

/// Fallback when the LANGID table is absent or empty.
const LANGID_EN_US: u16 = 0x0409;

impl<H: HostHal> HostController<H> {
    fn lang_id(&self) -> Result<u16> {
        if let Some(lang) = self.machine.lock().unwrap().lang_id {
            return Ok(lang);
        }
        let mut buf = [0u8; 255];
        let len = self.transfer_control(
            Setup::get_descriptor(DescriptorKind::String, 0, 0, 255).into(),
            ControlData::In(&mut buf),
        )?;
        let lang = if len >= 4 {
            u16::from_le_bytes([buf[2], buf[3]])
        } else {
            warn!("device reports no LANGID, assuming {:04x}", LANGID_EN_US);
            LANGID_EN_US
        };
        self.machine.lock().unwrap().lang_id = Some(lang);
        Ok(lang)
    }

    /// Fetch one string descriptor in the device's first listed language.
    /// Index 0 and malformed payloads read as `None`; transfer failures
    /// propagate.
    pub fn fetch_string(&self, index: u8) -> Result<Option<String>> {
        if index == 0 {
            return Ok(None);
        }
        let lang = self.lang_id()?;
        let mut buf = [0u8; 255];
        let len = self.transfer_control(
            Setup::get_descriptor(DescriptorKind::String, index, lang, 255).into(),
            ControlData::In(&mut buf),
        )?;
        if len < 2 {
            return Ok(None);
        }
        let end = len.min(usize::from(buf[0]));
        let units: Vec<u16> = buf[2..end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Some(String::from_utf16_lossy(&units)))
    }

    /// Pull the manufacturer/product/serial strings named by the device
    /// descriptor into the device summary.
    pub(crate) fn fetch_device_strings(&self) -> Result<()> {
        let desc = match self.machine.lock().unwrap().dev_desc {
            Some(desc) => desc,
            None => return Ok(()),
        };
        let manufacturer = self.fetch_string(desc.manufacturer_str)?;
        let product_name = self.fetch_string(desc.product_str)?;
        let serial = self.fetch_string(desc.serial_str)?;

        let mut machine = self.machine.lock().unwrap();
        machine.manufacturer = manufacturer;
        machine.product_name = product_name;
        machine.serial = serial;
        Ok(())
    }
}
