//! Thin safe layer over libusb: context lifecycle, device handles, and the
//! pipelined asynchronous bulk-IN reader used for stream captures.

mod async_read;
mod context;

pub use async_read::AsyncBulkIn;
pub use context::{UsbContext, UsbHandle};
