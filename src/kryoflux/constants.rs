#![allow(dead_code)]

use std::time::Duration;

//
// Device identity
//
pub const KRYOFLUX_VID: u16 = 0x03eb;
pub const KRYOFLUX_PID: u16 = 0x6124;
pub const KRYOFLUX_INTERFACE: u8 = 1;

//
// Bulk endpoints: EP1 OUT carries bootloader commands and firmware chunks,
// EP2 IN carries bootloader responses, the verify read-back, and the capture
// stream. Direction bits are added by the transport.
//
pub const COMMAND_ENDPOINT: u8 = 1;
pub const STREAM_ENDPOINT: u8 = 2;

//
// Firmware upload (SAM-BA style bootloader)
//
pub const FW_FILENAME: &str = "firmware.bin";
pub const FW_LOAD_ADDRESS: u32 = 0x0020_2000;
pub const FW_WRITE_CHUNK_SIZE: usize = 16384;
pub const FW_READ_CHUNK_SIZE: usize = 6400;

//
// Vendor control requests (bRequest values)
//
pub const REQUEST_RESET: u8 = 0x05;
pub const REQUEST_DEVICE: u8 = 0x06;
pub const REQUEST_MOTOR: u8 = 0x07;
pub const REQUEST_DENSITY: u8 = 0x08;
pub const REQUEST_SIDE: u8 = 0x09;
pub const REQUEST_TRACK: u8 = 0x0a;
pub const REQUEST_STREAM: u8 = 0x0b;
pub const REQUEST_MIN_TRACK: u8 = 0x0c;
pub const REQUEST_MAX_TRACK: u8 = 0x0d;
pub const REQUEST_STATUS: u8 = 0x80;
pub const REQUEST_INFO: u8 = 0x81;

// Vendor, device-to-host, recipient=other. The transport ORs in the IN bit.
pub const REQTYPE_IN_VENDOR_OTHER: u8 = 0xc3;

//
// Timeouts / delays
//
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
pub const BOOTLOADER_STRING_TIMEOUT: Duration = Duration::from_secs(1);
pub const FW_CHUNK_TIMEOUT: Duration = Duration::from_secs(2);
pub const STREAM_TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);
pub const REENUMERATION_DELAY: Duration = Duration::from_secs(1);

//
// Async capture session: 16 in-flight transfers of 32 KiB each.
//
pub const STREAM_BUFFER_COUNT: usize = 16;
pub const STREAM_BUFFER_SIZE: usize = 32768;

// The status probe must see two consecutive agreeing observations; bail out
// if the device keeps flapping this long.
pub const STATUS_SETTLE_LIMIT: usize = 50;
