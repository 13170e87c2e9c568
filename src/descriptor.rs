//! DFU descriptor helpers.
//!
//! A DFU-mode function is an interface descriptor (class 0xFE, subclass
//! 0x01, protocol 0x02) followed by the DFU functional descriptor that
//! carries the capability bits and transfer geometry. This module walks
//! and parses that pair from raw configuration-descriptor bytes, the
//! counterpart of what [`DfuModeClass`](crate::DfuModeClass) emits
//! during enumeration.

use core::cmp::min;

use crate::class::DfuAttributes;
use crate::{DESC_TYPE_DFU_FUNCTIONAL, USB_PROTOCOL_DFU_MODE, USB_SUBCLASS_DFU};

const DESC_TYPE_INTERFACE: u8 = 0x04;
const INTERFACE_DESC_LEN: usize = 9;
const FUNCTIONAL_DESC_LEN: usize = 9;

/// Checks whether `descriptors` starts with a DFU-mode interface
/// descriptor and returns the number of bytes the function occupies
/// (the interface descriptor plus an optional DFU functional
/// descriptor), bounded by `max_len`. Returns 0 if the interface is not
/// a DFU-mode interface.
pub fn dfu_mode_interface_len(descriptors: &[u8], max_len: usize) -> usize {
    let desc = &descriptors[..min(max_len, descriptors.len())];

    if desc.len() < INTERFACE_DESC_LEN || desc[1] != DESC_TYPE_INTERFACE {
        return 0;
    }

    // bInterfaceSubClass, bInterfaceProtocol
    if desc[6] != USB_SUBCLASS_DFU || desc[7] != USB_PROTOCOL_DFU_MODE {
        return 0;
    }

    let mut consumed = usize::from(desc[0]);

    if let Some(next) = desc.get(consumed..) {
        if next.len() >= 2 && next[1] == DESC_TYPE_DFU_FUNCTIONAL {
            consumed += usize::from(next[0]);
        }
    }

    min(consumed, desc.len())
}

/// Parsed DFU functional descriptor.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FunctionalDescriptor {
    /// bmAttributes capability bits.
    pub attributes: DfuAttributes,
    /// wDetachTimeOut in milliseconds.
    pub detach_timeout: u16,
    /// wTransferSize, the block size the host should use.
    pub transfer_size: u16,
    /// bcdDFUVersion.
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    /// Parses a DFU functional descriptor from `bytes`. Returns `None`
    /// if the bytes do not start with one.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FUNCTIONAL_DESC_LEN
            || usize::from(bytes[0]) < FUNCTIONAL_DESC_LEN
            || bytes[1] != DESC_TYPE_DFU_FUNCTIONAL
        {
            return None;
        }

        Some(Self {
            attributes: DfuAttributes::from_bits(bytes[2]),
            detach_timeout: u16::from_le_bytes([bytes[3], bytes[4]]),
            transfer_size: u16::from_le_bytes([bytes[5], bytes[6]]),
            dfu_version: u16::from_le_bytes([bytes[7], bytes[8]]),
        })
    }
}
