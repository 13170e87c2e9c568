#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! DFU-mode (reprogramming mode) side of the USB Device Firmware
//! Upgrade class, version 1.1, for a `usb-device` device.
//!
//! ## About
//!
//! A DFU-capable device has two personalities: the run-time mode, where
//! the normal application runs and at most answers `DFU_DETACH`, and
//! the DFU mode, where the device's only job is moving a firmware image
//! over the default control pipe and committing it. This crate
//! implements the DFU-mode personality: the eleven-state protocol state
//! machine, the class-specific control requests, the bus-reset
//! transitions, and the poll-timeout pacing that lets a device program
//! flash between host polls.
//!
//! The crate deliberately contains no memory-programming code. Reading,
//! writing and validating the image, starting the poll-timeout timer,
//! and rebooting into the application are delegated to the
//! [`DfuModeHandler`] implementation supplied by the user, so the same
//! class runs on any target the `usb-device` ecosystem supports.
//!
//! ## Protocol flow
//!
//! After enumeration the interface sits in `dfuIDLE`. A download is a
//! sequence of `DFU_DNLOAD` blocks, each acknowledged through
//! `DFU_GETSTATUS` while the device programs the block within the
//! advertised poll timeout, terminated by a zero-length `DFU_DNLOAD`
//! and the manifestation phase. An upload streams blocks back to the
//! host until the device answers with a short frame. Errors park the
//! interface in `dfuERROR` until the host issues `DFU_CLRSTATUS`; a bus
//! reset leaves DFU mode entirely.
//!
//! Works with standard host-side tools such as
//! [dfu-util](http://dfu-util.sourceforge.net/).
//!
//! ## Example
//!
//! ```no_run
//! use usb_device::bus::{UsbBus, UsbBusAllocator};
//! use usbd_dfu_mode::{DfuAttributes, DfuError, DfuModeClass, DfuModeHandler};
//!
//! struct Flash {
//!     image_complete: bool,
//! }
//!
//! impl DfuModeHandler for Flash {
//!     const TRANSFER_SIZE: u16 = 64;
//!
//!     fn attributes(&mut self) -> DfuAttributes {
//!         DfuAttributes::CAN_DOWNLOAD
//!             | DfuAttributes::CAN_UPLOAD
//!             | DfuAttributes::MANIFESTATION_TOLERANT
//!     }
//!
//!     fn firmware_valid(&mut self) -> bool {
//!         // e.g. check an image checksum
//!         true
//!     }
//!
//!     fn reboot_to_runtime(&mut self) {
//!         // switch the USB stack back to the application firmware
//!     }
//!
//!     fn dnload_data(&mut self, block_num: u16, data: &[u8]) -> Result<(), DfuError> {
//!         // queue `data` for programming at block `block_num`
//!         let _ = (block_num, data);
//!         Ok(())
//!     }
//!
//!     fn upload_data(&mut self, block_num: u16, buf: &mut [u8]) -> Result<usize, DfuError> {
//!         // fill `buf` from flash; return less than buf.len() to finish
//!         let _ = block_num;
//!         buf.fill(0xff);
//!         Ok(buf.len())
//!     }
//!
//!     fn data_done(&mut self) -> bool {
//!         self.image_complete
//!     }
//!
//!     fn start_poll_timeout(&mut self, millis: u32) {
//!         // arm a hardware timer; on expiry the application calls
//!         // dfu.poll_timeout_expired()
//!         let _ = millis;
//!     }
//!
//!     fn poll_timeout(&mut self) -> u32 {
//!         8
//!     }
//! }
//!
//! fn setup<B: UsbBus>(alloc: &UsbBusAllocator<B>) -> DfuModeClass<B, Flash> {
//!     DfuModeClass::new(alloc, Flash { image_complete: false })
//! }
//! ```
//!
//! `usb_dev.poll(&mut [&mut dfu])` must be called periodically, usually
//! from the USB interrupt; handler methods are invoked from there.
//!

/// DFU protocol module
pub mod class;
pub mod descriptor;

#[doc(inline)]
pub use crate::class::{
    DfuAttributes, DfuError, DfuModeClass, DfuModeHandler, DfuState, DfuStatus,
};

/// bInterfaceClass of a DFU interface (application specific).
pub const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
/// bInterfaceSubClass of a DFU interface.
pub const USB_SUBCLASS_DFU: u8 = 0x01;
/// bInterfaceProtocol of the DFU-mode interface (run-time mode is 0x01).
pub const USB_PROTOCOL_DFU_MODE: u8 = 0x02;
/// bDescriptorType of the DFU functional descriptor.
pub const DESC_TYPE_DFU_FUNCTIONAL: u8 = 0x21;
/// bcdDFUVersion advertised in the functional descriptor.
pub const DFU_VERSION: u16 = 0x0110;
