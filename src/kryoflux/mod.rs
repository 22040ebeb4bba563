//! KryoFlux device control: firmware bring-up, configuration, and the
//! motor/stream vendor requests driving a capture.

pub mod bootloader;
pub mod constants;
mod device;

pub use device::KryofluxDevice;
