use core::cmp::min;
use core::marker::PhantomData;
use usb_device::{class_prelude::*, control::Request};

use crate::{DESC_TYPE_DFU_FUNCTIONAL, DFU_VERSION};
use crate::{USB_CLASS_APPLICATION_SPECIFIC, USB_PROTOCOL_DFU_MODE, USB_SUBCLASS_DFU};

const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

/// Capacity of the context transfer buffer, shared by upload and
/// download. `usb-device` caps control transfers at its control pipe
/// buffer, so nothing larger can arrive in one request.
const TRANSFER_BUF_CAPACITY: usize = 256;

/// DFU interface state, as reported in `DFU_GETSTATUS` and `DFU_GETSTATE`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuState {
    /// Device is running its normal application.
    AppIdle = 0,
    /// Device has received DFU_DETACH (or, here, was just constructed)
    /// and is waiting for a USB reset to enter the DFU protocol proper.
    AppDetach = 1,
    /// Device is operating in DFU mode and is waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for DFU_GETSTATUS.
    DfuDnloadSync = 3,
    /// Device is programming a received block into nonvolatile memory.
    DfuDnBusy = 4,
    /// Device is processing a download operation, expecting DFU_DNLOAD.
    DfuDnloadIdle = 5,
    /// Device has received the final block and is waiting for
    /// DFU_GETSTATUS to begin (or conclude) the manifestation phase.
    DfuManifestSync = 6,
    /// Device is in the manifestation phase.
    DfuManifest = 7,
    /// Device has programmed its memories and waits for a USB reset.
    DfuManifestWaitReset = 8,
    /// Device is processing an upload operation, expecting DFU_UPLOAD.
    DfuUploadIdle = 9,
    /// An error has occurred. Awaiting DFU_CLRSTATUS.
    DfuError = 10,
}

/// Status code reported in the first byte of the `DFU_GETSTATUS` payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuStatus {
    /// No error condition is present.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails a vendor-specific test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory, received address is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but the device does not
    /// think it has all of the data yet.
    ErrNotdone = 0x09,
    /// Device firmware is corrupt, cannot return to run-time operation.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPor = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

/// Errors an application callback may report. Each maps to the
/// corresponding `DFU_GETSTATUS` status code and parks the interface in
/// [`DfuState::DfuError`] until the host recovers with DFU_CLRSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuError {
    /// File is not targeted for use by this device.
    Target,
    /// File is for this device but fails a vendor-specific test.
    File,
    /// Device is unable to write memory.
    Write,
    /// Memory erase function failed.
    Erase,
    /// Memory erase check failed.
    CheckErased,
    /// Program memory function failed.
    Prog,
    /// Programmed memory failed verification.
    Verify,
    /// Received address is out of range.
    Address,
    /// The image is incomplete.
    NotDone,
    /// Device firmware is corrupt.
    Firmware,
    /// A vendor-specific error.
    Vendor,
    /// Something went wrong, but the device does not know what it was.
    Unknown,
}

impl From<DfuError> for DfuStatus {
    fn from(e: DfuError) -> Self {
        match e {
            DfuError::Target => DfuStatus::ErrTarget,
            DfuError::File => DfuStatus::ErrFile,
            DfuError::Write => DfuStatus::ErrWrite,
            DfuError::Erase => DfuStatus::ErrErase,
            DfuError::CheckErased => DfuStatus::ErrCheckErased,
            DfuError::Prog => DfuStatus::ErrProg,
            DfuError::Verify => DfuStatus::ErrVerify,
            DfuError::Address => DfuStatus::ErrAddress,
            DfuError::NotDone => DfuStatus::ErrNotdone,
            DfuError::Firmware => DfuStatus::ErrFirmware,
            DfuError::Vendor => DfuStatus::ErrVendor,
            DfuError::Unknown => DfuStatus::ErrUnknown,
        }
    }
}

/// DFU functional descriptor capability bits (bmAttributes).
///
/// The set a device advertises comes from
/// [`DfuModeHandler::attributes`] and is cached for the lifetime of the
/// interface; a bus reset re-reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DfuAttributes(u8);

impl DfuAttributes {
    /// bitCanDnload: firmware download (host to device) is supported.
    pub const CAN_DOWNLOAD: Self = Self(0x01);
    /// bitCanUpload: firmware upload (device to host) is supported.
    pub const CAN_UPLOAD: Self = Self(0x02);
    /// bitManifestationTolerant: the device stays on the bus and keeps
    /// answering requests after manifestation.
    pub const MANIFESTATION_TOLERANT: Self = Self(0x04);
    /// bitWillDetach: the device detaches itself on DFU_DETACH instead
    /// of waiting for a USB reset.
    pub const WILL_DETACH: Self = Self(0x08);

    /// No capabilities.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds the set from a raw bmAttributes byte. Reserved bits are
    /// discarded.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    /// Raw bmAttributes byte.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for DfuAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The application side of the DFU-mode interface.
///
/// The class owns the protocol state machine and the control-transfer
/// plumbing; everything device-specific (flash programming, image
/// validation, the poll-timeout timer, rebooting into the application)
/// is delegated through this trait. Required methods correspond to
/// callbacks every DFU-mode device needs; methods with a default body
/// are optional hooks.
///
/// All methods are called from `usb_dev.poll([..])`, i.e. usually from
/// the USB interrupt. None of them may block: programming work should
/// be scheduled and its completion signalled through the poll-timeout
/// mechanism and [`data_done`](DfuModeHandler::data_done).
pub trait DfuModeHandler {
    /// wDetachTimeOut field of the DFU functional descriptor, in
    /// milliseconds. Mostly of interest to the run-time interface.
    const DETACH_TIMEOUT: u16 = 250;

    /// wTransferSize field of the DFU functional descriptor: the block
    /// size the host is told to use.
    ///
    /// **Warning**: must not exceed `usb-device`'s control endpoint
    /// buffer size (128 bytes by default), otherwise transfers fail for
    /// no obvious reason.
    const TRANSFER_SIZE: u16 = 128;

    /// iInterface string for the DFU-mode interface. Host tools display
    /// it when listing DFU devices.
    const INTERFACE_STRING: &'static str = "Firmware upgrade";

    /// Capability bits for the DFU functional descriptor. Read once at
    /// construction and again on every bus reset; must not change in
    /// between.
    fn attributes(&mut self) -> DfuAttributes;

    /// Whether the currently stored application firmware is runnable.
    /// Queried on bus reset from active DFU states to decide between
    /// returning to run-time mode and parking in [`DfuState::DfuError`].
    fn firmware_valid(&mut self) -> bool;

    /// The interface is returning to run-time mode ([`DfuState::AppIdle`]
    /// after a bus reset). The application is expected to bring the USB
    /// stack back up in its run-time configuration; this call may not
    /// return.
    fn reboot_to_runtime(&mut self);

    /// A download block arrived. `data` is the received data stage of a
    /// DFU_DNLOAD; the application schedules or performs the program
    /// operation. Runs after the poll timeout for the block has been
    /// started, so a slow write is paced by
    /// [`start_poll_timeout`](DfuModeHandler::start_poll_timeout).
    fn dnload_data(&mut self, block_num: u16, data: &[u8]) -> Result<(), DfuError>;

    /// An upload block was requested. Fill `buf` and return the number
    /// of bytes to send; returning less than `buf.len()` tells the host
    /// the upload is complete.
    fn upload_data(&mut self, block_num: u16, buf: &mut [u8]) -> Result<usize, DfuError>;

    /// Whether every byte of the image has been received and programmed.
    /// Queried when the host sends the terminating zero-length
    /// DFU_DNLOAD.
    fn data_done(&mut self) -> bool;

    /// Start the platform poll-timeout timer. Once `millis` have
    /// elapsed, the application must call
    /// [`DfuModeClass::poll_timeout_expired`] (serialized with USB
    /// interrupt handling).
    fn start_poll_timeout(&mut self, millis: u32);

    /// Current bwPollTimeout value in milliseconds, reported to the
    /// host in every DFU_GETSTATUS reply and used when starting the
    /// platform timer. Truncated to 24 bits on the wire.
    fn poll_timeout(&mut self) -> u32 {
        0
    }

    /// Index into the string descriptor table describing the current
    /// status, for the iString field of DFU_GETSTATUS.
    fn status_string_index(&mut self) -> u8 {
        0
    }

    /// The host aborted an ongoing download or upload session.
    fn abort(&mut self) {}

    /// Bus-reset override. Return `Some(state)` to pick the post-reset
    /// state instead of the default firmware-validity policy. Not
    /// consulted for the initial transition out of
    /// [`DfuState::AppDetach`].
    fn usb_reset(&mut self, current: DfuState) -> Option<DfuState> {
        let _ = current;
        None
    }

    /// Vendor-specific IN request on this interface. Fill `buf` and
    /// return `Some(len)` to answer, `None` to stall. The interface
    /// state is not affected either way.
    fn nonstandard_request_in(&mut self, request: Request, buf: &mut [u8]) -> Option<usize> {
        let _ = (request, buf);
        None
    }

    /// Vendor-specific OUT request on this interface. Return `true` to
    /// acknowledge, `false` to stall. The interface state is not
    /// affected either way.
    fn nonstandard_request_out(&mut self, request: Request, data: &[u8]) -> bool {
        let _ = (request, data);
        false
    }
}

// Work queued by a request handler that must run only after the reply
// for that request has gone out on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Deferred {
    None,
    /// Start the block poll timeout and hand the buffered block to the
    /// application.
    DownloadReply,
    /// Start the manifestation poll timeout.
    ManifestPoll,
}

// The single per-interface state record.
struct Context {
    state: DfuState,
    status: DfuStatus,
    attrs: DfuAttributes,
    blk_transfer_in_proc: bool,
    last_block_num: u16,
    last_transfer_len: u16,
    deferred: Deferred,
    transfer_buf: [u8; TRANSFER_BUF_CAPACITY],
}

impl Context {
    const fn new() -> Self {
        Self {
            state: DfuState::AppDetach,
            status: DfuStatus::Ok,
            attrs: DfuAttributes::empty(),
            blk_transfer_in_proc: false,
            last_block_num: 0,
            last_transfer_len: 0,
            deferred: Deferred::None,
            transfer_buf: [0; TRANSFER_BUF_CAPACITY],
        }
    }

    fn enter(&mut self, state: DfuState) {
        #[cfg(feature = "defmt")]
        if state != self.state {
            defmt::trace!("dfu: {} -> {}", self.state, state);
        }
        self.state = state;
    }

    // Callback-reported failure: record the code, park in DfuError.
    fn fail(&mut self, error: DfuError) {
        self.status = error.into();
        self.enter(DfuState::DfuError);
    }

    fn clear_block_bookkeeping(&mut self) {
        self.blk_transfer_in_proc = false;
        self.last_block_num = 0;
        self.last_transfer_len = 0;
    }
}

/// USB DFU-mode class for the `usb-device` stack.
///
/// Implements the DFU 1.1 protocol state machine over the default
/// control pipe. One instance serves one DFU interface; the run-time
/// (DFU_DETACH) interface of an application firmware is a separate
/// class.
pub struct DfuModeClass<B: UsbBus, H: DfuModeHandler> {
    if_num: InterfaceNumber,
    interface_string: StringIndex,
    ctx: Context,
    handler: H,
    _bus: PhantomData<B>,
}

impl<B: UsbBus, H: DfuModeHandler> DfuModeClass<B, H> {
    /// Creates the DFU-mode class. The interface starts in
    /// [`DfuState::AppDetach`]; the bus reset that follows enumeration
    /// moves it to [`DfuState::DfuIdle`].
    pub fn new(alloc: &UsbBusAllocator<B>, mut handler: H) -> Self {
        let mut ctx = Context::new();
        ctx.attrs = handler.attributes();

        Self {
            if_num: alloc.interface(),
            interface_string: alloc.string(),
            ctx,
            handler,
            _bus: PhantomData,
        }
    }

    /// Current interface state.
    pub fn state(&self) -> DfuState {
        self.ctx.state
    }

    /// Current status code, as the next DFU_GETSTATUS will report it.
    pub fn status(&self) -> DfuStatus {
        self.ctx.status
    }

    /// Records a status code on behalf of the application, for failures
    /// detected outside the request callbacks. The next DFU_GETSTATUS
    /// surfaces it to the host.
    pub fn set_status(&mut self, status: DfuStatus) {
        self.ctx.status = status;
    }

    /// Poll-timeout expiry hook. The application calls this when the
    /// timer started by
    /// [`start_poll_timeout`](DfuModeHandler::start_poll_timeout)
    /// elapses; the call must be serialized with `usb_dev.poll([..])`.
    pub fn poll_timeout_expired(&mut self) {
        match self.ctx.state {
            DfuState::DfuDnBusy => {
                self.ctx.enter(DfuState::DfuDnloadSync);
            }
            DfuState::DfuManifest => {
                if self.ctx.attrs.contains(DfuAttributes::MANIFESTATION_TOLERANT) {
                    self.ctx.enter(DfuState::DfuManifestSync);
                } else {
                    self.ctx.enter(DfuState::DfuManifestWaitReset);
                }
            }
            _ => {}
        }
    }

    // Stall policy for a request the current state does not accept.
    // Most states also fault; the manifestation states, upload-idle,
    // and the error state itself stall without a transition.
    fn stall_policy(&mut self) {
        match self.ctx.state {
            DfuState::DfuManifest
            | DfuState::DfuManifestWaitReset
            | DfuState::DfuUploadIdle
            | DfuState::DfuError => {}
            _ => self.ctx.enter(DfuState::DfuError),
        }
    }

    fn default_in(&mut self, xfer: ControlIn<B>) {
        self.stall_policy();
        xfer.reject().ok();
    }

    fn default_out(&mut self, xfer: ControlOut<B>) {
        self.stall_policy();
        xfer.reject().ok();
    }

    fn max_transfer_len(&self) -> usize {
        min(usize::from(H::TRANSFER_SIZE), TRANSFER_BUF_CAPACITY)
    }

    // DFU_GETSTATUS: 6-byte payload. The poll timeout and the status
    // string index are queried from the application on every call.
    fn accept_status(&mut self, xfer: ControlIn<B>) {
        let timeout = self.handler.poll_timeout();
        let reply = [
            // bStatus
            self.ctx.status as u8,
            // bwPollTimeout
            timeout as u8,
            (timeout >> 8) as u8,
            (timeout >> 16) as u8,
            // bState
            self.ctx.state as u8,
            // iString
            self.handler.status_string_index(),
        ];
        xfer.accept_with(&reply).ok();
    }

    fn get_status(&mut self, xfer: ControlIn<B>, req: Request) {
        if req.length < 6 {
            return self.default_in(xfer);
        }

        match self.ctx.state {
            DfuState::DfuDnloadSync => {
                if self.ctx.blk_transfer_in_proc {
                    // Reply busy first; the timer start and the block
                    // handoff run from poll() once the reply is queued.
                    self.ctx.enter(DfuState::DfuDnBusy);
                    self.ctx.deferred = Deferred::DownloadReply;
                } else {
                    self.ctx.enter(DfuState::DfuDnloadIdle);
                }
                self.accept_status(xfer);
            }
            DfuState::DfuManifestSync => {
                if self.ctx.attrs.contains(DfuAttributes::MANIFESTATION_TOLERANT) {
                    if self.handler.firmware_valid() {
                        self.ctx.enter(DfuState::DfuIdle);
                    }
                } else {
                    self.ctx.enter(DfuState::DfuManifest);
                    self.ctx.deferred = Deferred::ManifestPoll;
                }
                self.accept_status(xfer);
            }
            DfuState::DfuIdle
            | DfuState::DfuDnloadIdle
            | DfuState::DfuUploadIdle
            | DfuState::DfuError => {
                self.accept_status(xfer);
            }
            // DfuDnBusy, the manifestation phase, and the app states
            // cannot answer.
            _ => self.default_in(xfer),
        }
    }

    fn get_state(&mut self, xfer: ControlIn<B>, req: Request) {
        if req.length == 0 {
            return self.default_in(xfer);
        }

        match self.ctx.state {
            DfuState::DfuDnBusy
            | DfuState::DfuManifest
            | DfuState::DfuManifestWaitReset
            | DfuState::AppIdle
            | DfuState::AppDetach => self.default_in(xfer),
            _ => {
                let state = self.ctx.state as u8;
                xfer.accept_with(&[state]).ok();
            }
        }
    }

    fn upload(&mut self, xfer: ControlIn<B>, req: Request) {
        match self.ctx.state {
            DfuState::DfuIdle => {
                if !self.ctx.attrs.contains(DfuAttributes::CAN_UPLOAD)
                    || usize::from(req.length) > self.max_transfer_len()
                {
                    return self.default_in(xfer);
                }
                self.ctx.enter(DfuState::DfuUploadIdle);
                self.accept_upload(xfer, req, false);
            }
            DfuState::DfuUploadIdle => {
                if usize::from(req.length) > self.max_transfer_len() {
                    return self.default_in(xfer);
                }
                self.accept_upload(xfer, req, true);
            }
            _ => self.default_in(xfer),
        }
    }

    fn accept_upload(&mut self, xfer: ControlIn<B>, req: Request, end_on_short: bool) {
        let len = usize::from(req.length);

        match self
            .handler
            .upload_data(req.value, &mut self.ctx.transfer_buf[..len])
        {
            Ok(count) => {
                let count = min(count, len);
                if end_on_short && count < len {
                    // Short frame: the upload session is over.
                    self.ctx.enter(DfuState::DfuIdle);
                }
                xfer.accept_with(&self.ctx.transfer_buf[..count]).ok();
            }
            Err(e) => {
                self.ctx.fail(e);
                xfer.reject().ok();
            }
        }
    }

    fn download(&mut self, xfer: ControlOut<B>, req: Request) {
        match self.ctx.state {
            DfuState::DfuIdle | DfuState::DfuDnloadIdle => {}
            _ => return self.default_out(xfer),
        }

        if req.length == 0 {
            // Terminating download request: the image must be complete
            // and a download session must actually be open.
            if self.ctx.state == DfuState::DfuDnloadIdle && self.handler.data_done() {
                self.ctx.enter(DfuState::DfuManifestSync);
                xfer.accept().ok();
            } else {
                self.default_out(xfer);
            }
            return;
        }

        let data = xfer.data();
        if !self.ctx.attrs.contains(DfuAttributes::CAN_DOWNLOAD)
            || data.len() > self.max_transfer_len()
        {
            return self.default_out(xfer);
        }

        self.ctx.transfer_buf[..data.len()].copy_from_slice(data);
        self.ctx.last_block_num = req.value;
        // The stack reports the length actually received, which may be
        // less than wLength.
        self.ctx.last_transfer_len = data.len() as u16;
        self.ctx.blk_transfer_in_proc = true;
        self.ctx.enter(DfuState::DfuDnloadSync);
        xfer.accept().ok();
    }

    fn clear_status(&mut self, xfer: ControlOut<B>) {
        match self.ctx.state {
            DfuState::DfuError => {
                // The status code survives until something else
                // overwrites it.
                self.ctx.enter(DfuState::DfuIdle);
                xfer.accept().ok();
            }
            _ => self.default_out(xfer),
        }
    }

    fn abort_request(&mut self, xfer: ControlOut<B>) {
        match self.ctx.state {
            DfuState::DfuIdle => {
                xfer.accept().ok();
            }
            DfuState::DfuDnloadIdle | DfuState::DfuUploadIdle => {
                self.handler.abort();
                self.ctx.enter(DfuState::DfuIdle);
                xfer.accept().ok();
            }
            _ => self.default_out(xfer),
        }
    }

    fn nonstandard_in(&mut self, xfer: ControlIn<B>, req: Request) {
        let len = min(usize::from(req.length), TRANSFER_BUF_CAPACITY);
        match self
            .handler
            .nonstandard_request_in(req, &mut self.ctx.transfer_buf[..len])
        {
            Some(count) => {
                let count = min(count, len);
                xfer.accept_with(&self.ctx.transfer_buf[..count]).ok();
            }
            None => {
                xfer.reject().ok();
            }
        }
    }

    fn nonstandard_out(&mut self, xfer: ControlOut<B>, req: Request) {
        if self.handler.nonstandard_request_out(req, xfer.data()) {
            xfer.accept().ok();
        } else {
            xfer.reject().ok();
        }
    }

    // Deferred work, run once the reply that queued it is on the wire.
    fn run_deferred(&mut self) {
        match self.ctx.deferred {
            Deferred::None => return,
            Deferred::DownloadReply => {
                let timeout = self.handler.poll_timeout();
                self.handler.start_poll_timeout(timeout);

                let block_num = self.ctx.last_block_num;
                let len = usize::from(self.ctx.last_transfer_len);
                if let Err(e) = self
                    .handler
                    .dnload_data(block_num, &self.ctx.transfer_buf[..len])
                {
                    self.ctx.fail(e);
                }
                self.ctx.clear_block_bookkeeping();
            }
            Deferred::ManifestPoll => {
                let timeout = self.handler.poll_timeout();
                self.handler.start_poll_timeout(timeout);
            }
        }
        self.ctx.deferred = Deferred::None;
    }
}

impl<B: UsbBus, H: DfuModeHandler> UsbClass<B> for DfuModeClass<B, H> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface_alt(
            self.if_num,
            0,
            USB_CLASS_APPLICATION_SPECIFIC,
            USB_SUBCLASS_DFU,
            USB_PROTOCOL_DFU_MODE,
            Some(self.interface_string),
        )?;

        // DFU functional descriptor
        writer.write(
            DESC_TYPE_DFU_FUNCTIONAL,
            &[
                // bmAttributes
                self.ctx.attrs.bits(),
                // wDetachTimeOut
                (H::DETACH_TIMEOUT & 0xff) as u8,
                (H::DETACH_TIMEOUT >> 8) as u8,
                // wTransferSize
                (H::TRANSFER_SIZE & 0xff) as u8,
                (H::TRANSFER_SIZE >> 8) as u8,
                // bcdDFUVersion
                (DFU_VERSION & 0xff) as u8,
                (DFU_VERSION >> 8) as u8,
            ],
        )?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: u16) -> Option<&str> {
        if lang_id == usb_device::descriptor::lang_id::ENGLISH_US || lang_id == 0 {
            if index == self.interface_string {
                return Some(H::INTERFACE_STRING);
            }
        }
        None
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class {
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("dfu: request {=u8} in {}", req.request, self.ctx.state);

        match req.request {
            DFU_UPLOAD => self.upload(xfer, req),
            DFU_GETSTATUS => self.get_status(xfer, req),
            DFU_GETSTATE => self.get_state(xfer, req),
            // A DFU request code on the wrong direction is a host
            // violation, not vendor traffic.
            DFU_DETACH | DFU_DNLOAD | DFU_CLRSTATUS | DFU_ABORT => self.default_in(xfer),
            _ => self.nonstandard_in(xfer, req),
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.request_type != control::RequestType::Class {
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("dfu: request {=u8} in {}", req.request, self.ctx.state);

        match req.request {
            DFU_DNLOAD => self.download(xfer, req),
            DFU_CLRSTATUS => self.clear_status(xfer),
            DFU_ABORT => self.abort_request(xfer),
            // DFU_DETACH belongs to the run-time interface; in DFU mode
            // it is invalid in every state.
            DFU_DETACH | DFU_UPLOAD | DFU_GETSTATUS | DFU_GETSTATE => self.default_out(xfer),
            _ => self.nonstandard_out(xfer, req),
        }
    }

    fn reset(&mut self) {
        if self.ctx.state == DfuState::AppDetach {
            // The reset that follows enumeration: enter DFU mode proper.
            self.ctx.enter(DfuState::DfuIdle);
        } else if let Some(state) = self.handler.usb_reset(self.ctx.state) {
            self.ctx.enter(state);
        } else {
            match self.ctx.state {
                DfuState::DfuIdle
                | DfuState::DfuDnloadSync
                | DfuState::DfuDnBusy
                | DfuState::DfuDnloadIdle
                | DfuState::DfuManifestSync
                | DfuState::DfuManifest
                | DfuState::DfuManifestWaitReset
                | DfuState::DfuUploadIdle => {
                    if self.handler.firmware_valid() {
                        self.ctx.enter(DfuState::AppIdle);
                    } else {
                        self.ctx.enter(DfuState::DfuError);
                    }
                }
                DfuState::DfuError | DfuState::AppIdle | DfuState::AppDetach => {
                    self.ctx.enter(DfuState::AppIdle);
                }
            }
        }

        if self.ctx.state == DfuState::AppIdle {
            // may not return
            self.handler.reboot_to_runtime();
        }

        self.ctx.status = DfuStatus::Ok;
        self.ctx.attrs = self.handler.attributes();
        self.ctx.clear_block_bookkeeping();
        self.ctx.deferred = Deferred::None;
    }

    fn poll(&mut self) {
        self.run_deferred();
    }
}
