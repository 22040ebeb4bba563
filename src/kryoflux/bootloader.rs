//! Firmware upload handshake spoken to the bare bootloader personality.
//!
//! The protocol is line-oriented ASCII over the two bulk endpoints: the host
//! sends `N#`/`V#` probes, an `S<addr>,<size>#` load command followed by the
//! raw image, an `R<addr>,<size>#` read-back for verification, and finally
//! `G<addr>#` to start the freshly loaded firmware. Addresses and sizes are
//! 8-digit lower-case hex; device response lines end with LF CR.

use std::io;
use std::time::Duration;

use log::{debug, error};

use super::constants::{
    BOOTLOADER_STRING_TIMEOUT, FW_CHUNK_TIMEOUT, FW_LOAD_ADDRESS, FW_READ_CHUNK_SIZE,
    FW_WRITE_CHUNK_SIZE,
};

/// The two bulk pipes the bootloader conversation runs over.
pub trait BootloaderPort {
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> io::Result<()>;
    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Uploads `firmware` to the load address, verifies it by reading it back,
/// and issues the go command. The device re-enumerates afterwards; reopening
/// it is the caller's business.
pub fn upload(port: &mut dyn BootloaderPort, firmware: &[u8]) -> io::Result<()> {
    query(port, "N#")?;
    query(port, "V#")?;

    send_string(
        port,
        &format!("S{:08x},{:08x}#", FW_LOAD_ADDRESS, firmware.len()),
    )?;
    for chunk in firmware.chunks(FW_WRITE_CHUNK_SIZE) {
        port.bulk_out(chunk, FW_CHUNK_TIMEOUT)?;
    }

    send_string(
        port,
        &format!("R{:08x},{:08x}#", FW_LOAD_ADDRESS, firmware.len()),
    )?;
    let mut readback = vec![0u8; FW_READ_CHUNK_SIZE];
    let mut offset = 0usize;
    let mut mismatch = false;
    while offset < firmware.len() {
        let want = FW_READ_CHUNK_SIZE.min(firmware.len() - offset);
        let len = port.bulk_in(&mut readback[..want], FW_CHUNK_TIMEOUT)?;
        if readback[..len] != firmware[offset..offset + len] {
            mismatch = true;
        }
        offset += len;
    }
    if mismatch {
        error!("firmware verify failed");
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "firmware verify failed",
        ));
    }

    send_string(port, &format!("G{FW_LOAD_ADDRESS:08x}#"))
}

fn send_string(port: &mut dyn BootloaderPort, s: &str) -> io::Result<()> {
    port.bulk_out(s.as_bytes(), BOOTLOADER_STRING_TIMEOUT)
}

/// Reads one response line, stopping once the trailing LF CR pair arrives or
/// the buffer fills up.
fn recv_string(port: &mut dyn BootloaderPort) -> io::Result<String> {
    let mut buf = [0u8; 512];
    let mut total = 0usize;
    while total < buf.len() {
        let len = port.bulk_in(&mut buf[total..], BOOTLOADER_STRING_TIMEOUT)?;
        total += len;
        if total >= 2 && buf[total - 1] == 0x0d && buf[total - 2] == 0x0a {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf[..total]).into_owned())
}

fn query(port: &mut dyn BootloaderPort, id: &str) -> io::Result<()> {
    send_string(port, id)?;
    let response = recv_string(port)?;
    debug!("bootloader response to {id}: {}", response.trim_end());
    Ok(())
}
