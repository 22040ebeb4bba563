use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_ADDRESS_MASK, LIBUSB_ENDPOINT_IN, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{error, warn};

use super::context::{
    UsbContext, UsbHandle, duration_to_timeout, libusb_error_string, map_libusb_error,
    transfer_status_string,
};

/// How often the quiescence wait wakes up to pump events.
const FINISH_POLL_STEP: Duration = Duration::from_secs(1);

type Consumer = Box<dyn FnMut(Option<&[u8]>) -> bool>;

/// Heap-pinned session record; libusb transfer callbacks reach it through the
/// raw `user_data` pointer, so it must not move until quiescence.
struct SessionState {
    submitted: usize,
    consumer: Consumer,
    transfers: Vec<*mut libusb::libusb_transfer>,
    buffers: Vec<Vec<u8>>,
}

/// A pipelined asynchronous bulk-IN session.
///
/// `count` transfers are kept in flight; each completion hands its bytes to
/// the consumer, and the consumer's return value decides whether that slot is
/// resubmitted in place (`true`) or the whole session is cancelled (`false`).
/// Completions are dispatched in completion order from [`AsyncBulkIn::finish`],
/// on the caller's own thread.
pub struct AsyncBulkIn<'a> {
    ctx: Arc<UsbContext>,
    state: *mut SessionState,
    done: bool,
    _consumer: PhantomData<&'a mut ()>,
}

impl<'a> AsyncBulkIn<'a> {
    /// Allocates `count` buffers of `size` bytes and submits one bulk-IN
    /// transfer per buffer on endpoint `ep`. On a mid-submission failure the
    /// already-submitted transfers are cancelled and drained before the error
    /// is returned.
    pub fn start(
        ctx: Arc<UsbContext>,
        handle: &'a UsbHandle,
        ep: u8,
        count: usize,
        size: usize,
        timeout: Duration,
        consumer: impl FnMut(Option<&[u8]>) -> bool + 'a,
    ) -> io::Result<Self> {
        let consumer: Box<dyn FnMut(Option<&[u8]>) -> bool + 'a> = Box::new(consumer);
        // The consumer only runs inside finish()/drop, both bounded by 'a, so
        // erasing the lifetime for FFI storage cannot outlive the borrow.
        let consumer: Consumer = unsafe { mem::transmute(consumer) };

        let state = Box::new(SessionState {
            submitted: 0,
            consumer,
            transfers: vec![ptr::null_mut(); count],
            buffers: (0..count).map(|_| vec![0u8; size]).collect(),
        });
        let state_ptr = Box::into_raw(state);
        let mut session = AsyncBulkIn {
            ctx,
            state: state_ptr,
            done: false,
            _consumer: PhantomData,
        };

        for i in 0..count {
            let transfer = unsafe { libusb::libusb_alloc_transfer(0) };
            if transfer.is_null() {
                let _ = session.finish_inner();
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "failed to allocate libusb transfer",
                ));
            }
            unsafe {
                (*transfer).dev_handle = handle.raw();
                (*transfer).endpoint = (ep & LIBUSB_ENDPOINT_ADDRESS_MASK) | LIBUSB_ENDPOINT_IN;
                (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
                (*transfer).timeout = duration_to_timeout(timeout);
                (*transfer).callback = transfer_callback;
                (*transfer).user_data = state_ptr as *mut c_void;
                (*transfer).buffer = (&mut (*state_ptr).buffers)[i].as_mut_ptr();
                (*transfer).length = size as c_int;
                (&mut (*state_ptr).transfers)[i] = transfer;
            }
        }

        for i in 0..count {
            unsafe {
                let rc = libusb::libusb_submit_transfer((&(*state_ptr).transfers)[i]);
                if rc < 0 {
                    error!("failed to submit transfer: {}", libusb_error_string(rc));
                    session.cancel();
                    let _ = session.finish_inner();
                    return Err(map_libusb_error(rc));
                }
                (*state_ptr).submitted += 1;
            }
        }

        Ok(session)
    }

    /// Requests cancellation of every outstanding transfer. Idempotent, and
    /// safe on slots that were never submitted.
    pub fn cancel(&self) {
        unsafe { cancel_all(&mut *self.state) };
    }

    /// Pumps events until no transfer remains in flight, then releases all
    /// buffers and transfer records. `Ok` iff every pump step succeeded.
    pub fn finish(mut self) -> io::Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> io::Result<()> {
        let mut result = Ok(());
        unsafe {
            while (*self.state).submitted > 0 {
                if let Err(e) = self.ctx.handle_events(FINISH_POLL_STEP) {
                    error!("failed to handle events: {e}");
                    result = Err(e);
                }
            }
            let state = Box::from_raw(self.state);
            for &transfer in &state.transfers {
                if !transfer.is_null() {
                    libusb::libusb_free_transfer(transfer);
                }
            }
            // buffers dropped with the state box
        }
        self.done = true;
        result
    }
}

impl Drop for AsyncBulkIn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
            let _ = self.finish_inner();
        }
    }
}

unsafe fn cancel_all(state: &mut SessionState) {
    for &transfer in &state.transfers {
        if transfer.is_null() {
            continue;
        }
        let rc = unsafe { libusb::libusb_cancel_transfer(transfer) };
        // NOT_FOUND just means the transfer is not in flight.
        if rc < 0 && rc != LIBUSB_ERROR_NOT_FOUND {
            warn!("failed to cancel transfer: {}", libusb_error_string(rc));
        }
    }
}

extern "system" fn transfer_callback(transfer: *mut libusb::libusb_transfer) {
    unsafe {
        let state = &mut *((*transfer).user_data as *mut SessionState);
        let status = (*transfer).status;

        // Cancelled completions carry neither data nor error and bypass the
        // consumer entirely.
        if status == LIBUSB_TRANSFER_CANCELLED {
            state.submitted -= 1;
            return;
        }

        let data: Option<&[u8]> = if status == LIBUSB_TRANSFER_COMPLETED {
            Some(slice::from_raw_parts(
                (*transfer).buffer,
                (*transfer).actual_length as usize,
            ))
        } else {
            error!("bulk in transfer failed: {}", transfer_status_string(status));
            None
        };

        if (state.consumer)(data) {
            let rc = libusb::libusb_submit_transfer(transfer);
            if rc == 0 {
                return;
            }
            error!("failed to resubmit transfer: {}", libusb_error_string(rc));
        } else {
            cancel_all(state);
        }
        state.submitted -= 1;
    }
}
