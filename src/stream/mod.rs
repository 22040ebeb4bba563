//! KryoFlux stream handling: the incremental wire-format validator and the
//! per-track capture orchestration.

mod capture;
mod decoder;

pub use capture::{CaptureDevice, capture_track, capture_tracks, track_filename};
pub use decoder::StreamDecoder;
