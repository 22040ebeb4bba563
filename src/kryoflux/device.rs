use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};

use super::bootloader::{self, BootloaderPort};
use super::constants::{
    COMMAND_ENDPOINT, CONTROL_TIMEOUT, KRYOFLUX_INTERFACE, KRYOFLUX_PID, KRYOFLUX_VID,
    REENUMERATION_DELAY, REQTYPE_IN_VENDOR_OTHER, REQUEST_DENSITY, REQUEST_DEVICE, REQUEST_INFO,
    REQUEST_MAX_TRACK, REQUEST_MIN_TRACK, REQUEST_MOTOR, REQUEST_RESET, REQUEST_SIDE,
    REQUEST_STATUS, REQUEST_STREAM, REQUEST_TRACK, STATUS_SETTLE_LIMIT, STREAM_BUFFER_COUNT,
    STREAM_BUFFER_SIZE, STREAM_ENDPOINT, STREAM_TRANSFER_TIMEOUT,
};
use crate::stream::CaptureDevice;
use crate::usb::{AsyncBulkIn, UsbContext, UsbHandle};

/// An opened, firmware-loaded KryoFlux with its interface claimed.
///
/// `open` walks the whole bring-up: probe for firmware, upload it through the
/// bootloader if absent (the device re-enumerates and is reopened), then run
/// the reset sequence. After `configure` the device is ready for motor and
/// stream commands.
pub struct KryofluxDevice {
    ctx: Arc<UsbContext>,
    handle: UsbHandle,
}

impl KryofluxDevice {
    pub fn open(ctx: &Arc<UsbContext>, firmware_path: &Path) -> io::Result<Self> {
        let mut handle = open_and_claim(ctx)?;

        if check_fw_present(&handle)? {
            info!("device has firmware already");
        } else {
            info!("no firmware uploaded in device");
            install_firmware(&handle, firmware_path)?;

            // The go command makes the device drop off the bus; reopen it
            // after re-enumeration.
            drop(handle);
            thread::sleep(REENUMERATION_DELAY);
            handle = open_and_claim(ctx)?;

            if !check_fw_present(&handle)? {
                error!("device re-enumerated without working firmware");
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "device re-enumerated without working firmware",
                ));
            }
        }

        let device = KryofluxDevice {
            ctx: ctx.clone(),
            handle,
        };
        device.reset()?;
        Ok(device)
    }

    /// `RESET`, then the two `INFO` pages. All three must succeed before the
    /// device accepts configuration.
    fn reset(&self) -> io::Result<()> {
        self.request(REQUEST_RESET, 0)?;
        self.request(REQUEST_INFO, 1)?;
        self.request(REQUEST_INFO, 2)?;
        Ok(())
    }

    pub fn configure(
        &self,
        device: u8,
        density: u8,
        min_track: u8,
        max_track: u8,
    ) -> io::Result<()> {
        self.request(REQUEST_DEVICE, device as u16)?;
        self.request(REQUEST_DENSITY, density as u16)?;
        self.request(REQUEST_MIN_TRACK, min_track as u16)?;
        self.request(REQUEST_MAX_TRACK, max_track as u16)?;
        Ok(())
    }

    pub fn motor_on(&self, side: u8, track: u8) -> io::Result<()> {
        self.request(REQUEST_MOTOR, 1)?;
        self.request(REQUEST_SIDE, side as u16)?;
        self.request(REQUEST_TRACK, track as u16)?;
        Ok(())
    }

    pub fn motor_off(&self) -> io::Result<()> {
        self.request(REQUEST_MOTOR, 0)
    }

    pub fn stream_on(&self) -> io::Result<()> {
        self.request(REQUEST_STREAM, 1)
    }

    pub fn stream_off(&self) -> io::Result<()> {
        self.request(REQUEST_STREAM, 0)
    }

    /// Opens the pipelined bulk-IN session on the stream endpoint. The
    /// per-transfer timeout is long; gaps between chunks are normal while the
    /// drive spins up.
    pub fn start_async_read<'a>(
        &'a self,
        consumer: impl FnMut(Option<&[u8]>) -> bool + 'a,
    ) -> io::Result<AsyncBulkIn<'a>> {
        AsyncBulkIn::start(
            self.ctx.clone(),
            &self.handle,
            STREAM_ENDPOINT,
            STREAM_BUFFER_COUNT,
            STREAM_BUFFER_SIZE,
            STREAM_TRANSFER_TIMEOUT,
            consumer,
        )
    }

    fn request(&self, request: u8, index: u16) -> io::Result<()> {
        control_in(&self.handle, request, index, false)?;
        Ok(())
    }
}

impl CaptureDevice for KryofluxDevice {
    fn motor_on(&self, side: u8, track: u8) -> io::Result<()> {
        KryofluxDevice::motor_on(self, side, track)
    }

    fn motor_off(&self) -> io::Result<()> {
        KryofluxDevice::motor_off(self)
    }

    fn stream_capture(&self, consumer: &mut dyn FnMut(Option<&[u8]>) -> bool) -> io::Result<()> {
        let session = self.start_async_read(|data| consumer(data))?;
        if let Err(e) = self.stream_on() {
            // Leave the device in a sane state even though the capture never
            // started.
            session.cancel();
            let _ = session.finish();
            let _ = self.stream_off();
            return Err(e);
        }
        let drained = session.finish();
        let off = self.stream_off();
        drained?;
        off
    }
}

fn open_and_claim(ctx: &Arc<UsbContext>) -> io::Result<UsbHandle> {
    let handle = UsbHandle::open(ctx, KRYOFLUX_VID, KRYOFLUX_PID, 0)?;
    handle.claim_interface(KRYOFLUX_INTERFACE)?;
    Ok(handle)
}

/// Vendor control-IN carrying the argument in `wIndex`; a successful response
/// is a printable status string.
fn control_in(handle: &UsbHandle, request: u8, index: u16, silent_nak: bool) -> io::Result<usize> {
    let mut buf = [0u8; 512];
    let len = handle.sync_control_in(
        REQTYPE_IN_VENDOR_OTHER,
        request,
        0,
        index,
        &mut buf,
        CONTROL_TIMEOUT,
        silent_nak,
    )?;
    let text = &buf[..len];
    let text = match text.iter().position(|&b| b == 0) {
        Some(nul) => &text[..nul],
        None => text,
    };
    info!("device says: {}", String::from_utf8_lossy(text).trim_end());
    Ok(len)
}

fn try_check_status(handle: &UsbHandle) -> bool {
    // A NAK here just means the firmware is not (yet) answering.
    control_in(handle, REQUEST_STATUS, 0, true).is_ok()
}

fn check_fw_present(handle: &UsbHandle) -> io::Result<bool> {
    settle(|| try_check_status(handle))
}

/// Repeats the probe until two consecutive observations agree. The device
/// NAKs transiently around firmware start-up, so a single observation is not
/// trustworthy.
fn settle(mut probe: impl FnMut() -> bool) -> io::Result<bool> {
    let mut last = probe();
    for _ in 0..STATUS_SETTLE_LIMIT {
        let current = probe();
        if current == last {
            return Ok(current);
        }
        last = current;
    }
    error!("device status kept flapping, giving up");
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "device status did not settle",
    ))
}

fn install_firmware(handle: &UsbHandle, path: &Path) -> io::Result<()> {
    let image = fs::read(path).map_err(|e| {
        error!("{}: {e}", path.display());
        e
    })?;
    info!(
        "uploading firmware image {} ({} bytes)",
        path.display(),
        image.len()
    );
    bootloader::upload(&mut HandlePort(handle), &image)
}

/// Bootloader conversation bound to the real bulk endpoints.
struct HandlePort<'a>(&'a UsbHandle);

impl BootloaderPort for HandlePort<'_> {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> io::Result<()> {
        self.0.sync_bulk_out(COMMAND_ENDPOINT, data, timeout)
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.0.sync_bulk_in(STREAM_ENDPOINT, buf, timeout)
    }
}
