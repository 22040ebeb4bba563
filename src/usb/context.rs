use std::cell::Cell;
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_ADDRESS_MASK, LIBUSB_ENDPOINT_IN, LIBUSB_ENDPOINT_OUT,
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_PIPE,
    LIBUSB_ERROR_TIMEOUT, LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_ERROR,
    LIBUSB_TRANSFER_NO_DEVICE, LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL,
    LIBUSB_TRANSFER_TIMED_OUT,
};
use log::{error, info};

/// RAII wrapper owning the process-wide libusb context.
///
/// All transfer completions are dispatched from [`UsbContext::handle_events`],
/// which callers pump from the one thread that owns the capture run; there is
/// no background event thread.
pub struct UsbContext {
    ptr: *mut libusb::libusb_context,
}

impl UsbContext {
    pub fn new() -> io::Result<Arc<Self>> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("libusb init failed: {}", libusb_error_string(rc)),
            ));
        }
        Ok(Arc::new(UsbContext { ptr: ctx }))
    }

    pub(crate) fn raw(&self) -> *mut libusb::libusb_context {
        self.ptr
    }

    /// One timed event-pump step; dispatches any completed transfers.
    pub(crate) fn handle_events(&self, timeout: Duration) -> io::Result<()> {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };
        let rc = unsafe {
            libusb::libusb_handle_events_timeout_completed(self.ptr, &mut tv, ptr::null_mut())
        };
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }
}

impl Drop for UsbContext {
    fn drop(&mut self) {
        unsafe { libusb::libusb_exit(self.ptr) };
    }
}

/// An open device handle, closed (and its interface released) on drop.
pub struct UsbHandle {
    _context: Arc<UsbContext>,
    ptr: *mut libusb::libusb_device_handle,
    claimed: Cell<Option<u8>>,
}

impl UsbHandle {
    /// Opens the `ordinal`-th (0-indexed) device matching `vid:pid`.
    pub fn open(context: &Arc<UsbContext>, vid: u16, pid: u16, ordinal: u32) -> io::Result<Self> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(context.raw(), &mut list) };
        if count < 0 {
            return Err(map_libusb_error(count as i32));
        }

        let mut remaining = ordinal;
        let mut result: Option<io::Result<*mut libusb::libusb_device_handle>> = None;
        for i in 0..count as usize {
            let device = unsafe { *list.add(i) };
            let desc = match get_device_descriptor(device) {
                Ok(d) => d,
                Err(e) => {
                    error!("failed to get device descriptor: {e}");
                    continue;
                }
            };
            if desc.idVendor != vid || desc.idProduct != pid {
                continue;
            }
            if remaining > 0 {
                remaining -= 1;
                continue;
            }
            let mut handle = ptr::null_mut();
            let rc = unsafe { libusb::libusb_open(device, &mut handle) };
            result = Some(if rc < 0 {
                Err(map_libusb_error(rc))
            } else {
                Ok(handle)
            });
            break;
        }
        unsafe { libusb::libusb_free_device_list(list, 1) };

        match result {
            Some(Ok(handle)) => Ok(UsbHandle {
                _context: context.clone(),
                ptr: handle,
                claimed: Cell::new(None),
            }),
            Some(Err(e)) => {
                error!("failed to open device {vid:04x}:{pid:04x}: {e}");
                Err(e)
            }
            None => {
                error!("no device with vendor id {vid:#06x} and product id {pid:#06x} found");
                Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no device {vid:04x}:{pid:04x}"),
                ))
            }
        }
    }

    pub(crate) fn raw(&self) -> *mut libusb::libusb_device_handle {
        self.ptr
    }

    pub fn claim_interface(&self, interface: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.ptr, interface as c_int) };
        if rc < 0 {
            error!("claim interface failed: {}", libusb_error_string(rc));
            return Err(map_libusb_error(rc));
        }
        self.claimed.set(Some(interface));
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_release_interface(self.ptr, interface as c_int) };
        self.claimed.set(None);
        if rc < 0 {
            error!("release interface failed: {}", libusb_error_string(rc));
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    /// Bulk OUT on endpoint `ep` (1..15, direction bit added here). A short
    /// transfer is an error.
    pub fn sync_bulk_out(&self, ep: u8, data: &[u8], timeout: Duration) -> io::Result<()> {
        let mut transferred: c_int = 0;
        let rc = unsafe {
            libusb::libusb_bulk_transfer(
                self.ptr,
                (ep & LIBUSB_ENDPOINT_ADDRESS_MASK) | LIBUSB_ENDPOINT_OUT,
                data.as_ptr() as *mut u8,
                data.len() as c_int,
                &mut transferred,
                duration_to_timeout(timeout) as c_uint,
            )
        };
        if rc < 0 {
            error!("bulk out transfer failed: {}", libusb_error_string(rc));
            return Err(map_libusb_error(rc));
        }
        if transferred as usize != data.len() {
            error!(
                "bulk out truncated transfer: {} != {}",
                transferred,
                data.len()
            );
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "bulk out truncated transfer",
            ));
        }
        Ok(())
    }

    /// Bulk IN on endpoint `ep` (1..15, direction bit added here); returns the
    /// actual length received.
    pub fn sync_bulk_in(&self, ep: u8, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut transferred: c_int = 0;
        let rc = unsafe {
            libusb::libusb_bulk_transfer(
                self.ptr,
                (ep & LIBUSB_ENDPOINT_ADDRESS_MASK) | LIBUSB_ENDPOINT_IN,
                buf.as_mut_ptr(),
                buf.len() as c_int,
                &mut transferred,
                duration_to_timeout(timeout) as c_uint,
            )
        };
        if rc < 0 {
            error!("bulk in transfer failed: {}", libusb_error_string(rc));
            return Err(map_libusb_error(rc));
        }
        Ok(transferred as usize)
    }

    /// Vendor control IN. With `silent_nak`, a pipe/stall error is returned
    /// without logging; callers use that window to probe a device that may
    /// legitimately NAK while its firmware is coming up.
    pub fn sync_control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
        silent_nak: bool,
    ) -> io::Result<usize> {
        let rc = unsafe {
            libusb::libusb_control_transfer(
                self.ptr,
                request_type | LIBUSB_ENDPOINT_IN,
                request,
                value,
                index,
                buf.as_mut_ptr(),
                buf.len() as u16,
                duration_to_timeout(timeout),
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        if !(silent_nak && rc == LIBUSB_ERROR_PIPE) {
            error!("control in transfer failed: {}", libusb_error_string(rc));
        }
        Err(map_libusb_error(rc))
    }
}

impl Drop for UsbHandle {
    fn drop(&mut self) {
        if let Some(interface) = self.claimed.take() {
            unsafe { libusb::libusb_release_interface(self.ptr, interface as c_int) };
        }
        unsafe { libusb::libusb_close(self.ptr) };
    }
}

fn get_device_descriptor(
    device: *mut libusb::libusb_device,
) -> io::Result<libusb::libusb_device_descriptor> {
    let mut desc = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
    let rc = unsafe { libusb::libusb_get_device_descriptor(device, desc.as_mut_ptr()) };
    if rc < 0 {
        return Err(map_libusb_error(rc));
    }
    Ok(unsafe { desc.assume_init() })
}

pub(crate) fn libusb_error_string(code: i32) -> String {
    unsafe {
        let ptr = libusb::libusb_error_name(code);
        if ptr.is_null() {
            format!("libusb error {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

pub(crate) fn map_libusb_error(code: i32) -> io::Error {
    let kind = match code {
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_PIPE => io::ErrorKind::BrokenPipe,
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, libusb_error_string(code))
}

pub(crate) fn transfer_status_string(status: i32) -> &'static str {
    match status {
        s if s == LIBUSB_TRANSFER_TIMED_OUT => "transfer timed out",
        s if s == LIBUSB_TRANSFER_STALL => "halt condition detected",
        s if s == LIBUSB_TRANSFER_NO_DEVICE => "device was disconnected",
        s if s == LIBUSB_TRANSFER_OVERFLOW => "device sent more data than requested",
        s if s == LIBUSB_TRANSFER_CANCELLED => "transfer cancelled",
        s if s == LIBUSB_TRANSFER_ERROR => "transfer failed",
        _ => "unknown transfer status",
    }
}

#[inline]
pub(crate) fn duration_to_timeout(duration: Duration) -> u32 {
    if duration.is_zero() {
        return 0;
    }
    let millis = duration.as_millis();
    if millis == 0 {
        1
    } else if millis > c_uint::MAX as u128 {
        c_uint::MAX as u32
    } else {
        millis as u32
    }
}
