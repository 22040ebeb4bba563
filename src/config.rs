use std::path::PathBuf;

/// Which sides of each track a run captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideMode {
    Side0,
    Side1,
    Both,
}

impl SideMode {
    /// Maps the CLI flag value (0, 1, or 2=both).
    pub fn from_flag(value: u8) -> Option<SideMode> {
        match value {
            0 => Some(SideMode::Side0),
            1 => Some(SideMode::Side1),
            2 => Some(SideMode::Both),
            _ => None,
        }
    }

    pub fn includes(self, side: u8) -> bool {
        match self {
            SideMode::Side0 => side == 0,
            SideMode::Side1 => side == 1,
            SideMode::Both => true,
        }
    }
}

/// Validated run configuration handed to the capture orchestrator. Built by
/// the CLI; the core never parses arguments itself.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Output base name; each track lands in `<base>TT.S.raw`.
    pub basename: String,
    /// Drive select, 0 or 1.
    pub drive: u8,
    /// Density line, 0=L 1=H.
    pub density: u8,
    /// Head movement bounds sent to the device.
    pub min_track: u8,
    pub max_track: u8,
    /// First and last track actually captured.
    pub start_track: u8,
    pub end_track: u8,
    pub side_mode: SideMode,
    /// 1 = 80-track media, 2 = 40-track media.
    pub track_step: u8,
    /// Firmware image uploaded when the device enumerates as a bootloader.
    pub firmware_path: PathBuf,
}
