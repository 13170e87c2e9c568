#![allow(dead_code)]

use std::cell::RefCell;
use std::cmp::min;
use std::rc::Rc;

use usb_device::control::Request;
use usbd_dfu_mode::{DfuAttributes, DfuError, DfuModeHandler, DfuState};

// States on the wire
pub const APP_IDLE: u8 = 0;
pub const APP_DETACH: u8 = 1;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DNBUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

// Status codes on the wire
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_TARGET: u8 = 0x01;
pub const STATUS_ERR_FILE: u8 = 0x02;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_CHECK_ERASED: u8 = 0x05;
pub const STATUS_ERR_PROG: u8 = 0x06;
pub const STATUS_ERR_VERIFY: u8 = 0x07;
pub const STATUS_ERR_ADDRESS: u8 = 0x08;
pub const STATUS_ERR_NOTDONE: u8 = 0x09;
pub const STATUS_ERR_FIRMWARE: u8 = 0x0A;
pub const STATUS_ERR_VENDOR: u8 = 0x0B;
pub const STATUS_ERR_USBR: u8 = 0x0C;
pub const STATUS_ERR_POR: u8 = 0x0D;
pub const STATUS_ERR_UNKNOWN: u8 = 0x0E;
pub const STATUS_ERR_STALLED_PKT: u8 = 0x0F;

// Request codes
pub const REQ_DETACH: u8 = 0x00;
pub const REQ_DNLOAD: u8 = 0x01;
pub const REQ_UPLOAD: u8 = 0x02;
pub const REQ_GETSTATUS: u8 = 0x03;
pub const REQ_CLRSTATUS: u8 = 0x04;
pub const REQ_GETSTATE: u8 = 0x05;
pub const REQ_ABORT: u8 = 0x06;

// Setup packets, recipient = interface 0

pub fn class_in(request: u8, value: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let l = length.to_le_bytes();
    [0xa1, request, v[0], v[1], 0, 0, l[0], l[1]]
}

pub fn class_out(request: u8, value: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let l = length.to_le_bytes();
    [0x21, request, v[0], v[1], 0, 0, l[0], l[1]]
}

pub fn dnload(block_num: u16, length: u16) -> [u8; 8] {
    class_out(REQ_DNLOAD, block_num, length)
}

pub fn upload(block_num: u16, length: u16) -> [u8; 8] {
    class_in(REQ_UPLOAD, block_num, length)
}

pub fn get_status() -> [u8; 8] {
    class_in(REQ_GETSTATUS, 0, 6)
}

pub fn clr_status() -> [u8; 8] {
    class_out(REQ_CLRSTATUS, 0, 0)
}

pub fn get_state() -> [u8; 8] {
    class_in(REQ_GETSTATE, 0, 1)
}

pub fn abort() -> [u8; 8] {
    class_out(REQ_ABORT, 0, 0)
}

pub fn detach() -> [u8; 8] {
    class_out(REQ_DETACH, 0, 0)
}

/// Expected DFU_GETSTATUS payload.
pub fn status(status: u8, poll_timeout: u32, state: u8, istring: u8) -> [u8; 6] {
    let t = poll_timeout.to_le_bytes();
    [status, t[0], t[1], t[2], state, istring]
}

/// Everything the test can tune or observe about the device side.
/// Shared with the handler through an `Rc` so the test keeps a view
/// after the class takes ownership of the handler.
pub struct RigState {
    pub attrs: u8,
    pub firmware_valid: bool,
    pub data_done: bool,
    pub poll_timeout_ms: u32,
    pub string_index: u8,
    /// Upload source; served in wLength-sized blocks.
    pub image: Vec<u8>,
    pub dnload_error: Option<DfuError>,
    pub upload_error: Option<DfuError>,
    pub reset_override: Option<fn(DfuState) -> DfuState>,
    pub vendor_handled: bool,

    pub downloaded: Vec<(u16, Vec<u8>)>,
    pub timeouts_started: Vec<u32>,
    pub upload_requests: Vec<(u16, usize)>,
    pub aborts: usize,
    pub reboots: usize,
    pub vendor_out: Vec<(u8, Vec<u8>)>,
}

impl Default for RigState {
    fn default() -> Self {
        Self {
            attrs: 0x0F,
            firmware_valid: true,
            data_done: true,
            poll_timeout_ms: 0,
            string_index: 0,
            image: Vec::new(),
            dnload_error: None,
            upload_error: None,
            reset_override: None,
            vendor_handled: false,
            downloaded: Vec::new(),
            timeouts_started: Vec::new(),
            upload_requests: Vec::new(),
            aborts: 0,
            reboots: 0,
            vendor_out: Vec::new(),
        }
    }
}

pub struct TestRig(pub Rc<RefCell<RigState>>);

impl TestRig {
    pub fn new() -> (Self, Rc<RefCell<RigState>>) {
        let state = Rc::new(RefCell::new(RigState::default()));
        (Self(state.clone()), state)
    }

    pub fn with(f: impl FnOnce(&mut RigState)) -> (Self, Rc<RefCell<RigState>>) {
        let (rig, state) = Self::new();
        f(&mut state.borrow_mut());
        (rig, state)
    }
}

impl DfuModeHandler for TestRig {
    const TRANSFER_SIZE: u16 = 64;
    const DETACH_TIMEOUT: u16 = 0x1122;

    fn attributes(&mut self) -> DfuAttributes {
        DfuAttributes::from_bits(self.0.borrow().attrs)
    }

    fn firmware_valid(&mut self) -> bool {
        self.0.borrow().firmware_valid
    }

    fn reboot_to_runtime(&mut self) {
        self.0.borrow_mut().reboots += 1;
    }

    fn dnload_data(&mut self, block_num: u16, data: &[u8]) -> Result<(), DfuError> {
        let mut s = self.0.borrow_mut();
        s.downloaded.push((block_num, data.to_vec()));
        match s.dnload_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn upload_data(&mut self, block_num: u16, buf: &mut [u8]) -> Result<usize, DfuError> {
        let mut s = self.0.borrow_mut();
        s.upload_requests.push((block_num, buf.len()));

        if let Some(e) = s.upload_error {
            return Err(e);
        }

        // blocks are wLength-sized, constant within one session
        let offset = min(usize::from(block_num) * buf.len(), s.image.len());
        let len = min(buf.len(), s.image.len() - offset);
        buf[..len].copy_from_slice(&s.image[offset..offset + len]);
        Ok(len)
    }

    fn data_done(&mut self) -> bool {
        self.0.borrow().data_done
    }

    fn start_poll_timeout(&mut self, millis: u32) {
        self.0.borrow_mut().timeouts_started.push(millis);
    }

    fn poll_timeout(&mut self) -> u32 {
        self.0.borrow().poll_timeout_ms
    }

    fn status_string_index(&mut self) -> u8 {
        self.0.borrow().string_index
    }

    fn abort(&mut self) {
        self.0.borrow_mut().aborts += 1;
    }

    fn usb_reset(&mut self, current: DfuState) -> Option<DfuState> {
        self.0.borrow().reset_override.map(|f| f(current))
    }

    fn nonstandard_request_in(&mut self, request: Request, buf: &mut [u8]) -> Option<usize> {
        let _ = request;
        if self.0.borrow().vendor_handled {
            let reply = b"ACME";
            let len = min(reply.len(), buf.len());
            buf[..len].copy_from_slice(&reply[..len]);
            Some(len)
        } else {
            None
        }
    }

    fn nonstandard_request_out(&mut self, request: Request, data: &[u8]) -> bool {
        let mut s = self.0.borrow_mut();
        if s.vendor_handled {
            s.vendor_out.push((request.request, data.to_vec()));
            true
        } else {
            false
        }
    }
}
