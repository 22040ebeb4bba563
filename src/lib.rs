//! Host-side capture core for KryoFlux flux-sampling devices: firmware
//! bring-up, vendor control configuration, and per-track raw stream capture.

pub mod config;
pub mod kryoflux;
pub mod stream;
pub mod usb;

pub use config::{CaptureConfig, SideMode};
pub use kryoflux::KryofluxDevice;
pub use stream::{CaptureDevice, StreamDecoder, capture_tracks};
pub use usb::UsbContext;
