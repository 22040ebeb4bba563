use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;
use log::error;

use super::decoder::StreamDecoder;
use crate::config::CaptureConfig;

/// The device surface a capture run drives. Implemented by the real KryoFlux
/// controller; captures can also be replayed against a scripted device.
pub trait CaptureDevice {
    fn motor_on(&self, side: u8, track: u8) -> io::Result<()>;
    fn motor_off(&self) -> io::Result<()>;

    /// Runs one streaming read: deliver every arriving chunk to `consumer`
    /// until it returns `false`, then bring the stream back down. The
    /// consumer contract is the transport's: `None` is a transfer error, an
    /// empty chunk is legal, and the return value decides continuation.
    fn stream_capture(&self, consumer: &mut dyn FnMut(Option<&[u8]>) -> bool) -> io::Result<()>;
}

/// Captures every requested (track, side) coordinate to `<base>TT.S.raw`
/// files. The first failed track aborts the run; the drive motor is switched
/// off either way.
pub fn capture_tracks(dev: &dyn CaptureDevice, cfg: &CaptureConfig) -> io::Result<()> {
    let mut result = Ok(());
    'tracks: for track in (cfg.start_track..=cfg.end_track).step_by(cfg.track_step as usize) {
        for side in 0..2u8 {
            if !cfg.side_mode.includes(side) {
                continue;
            }
            print!("{track:02}.{side}    : ");
            let _ = io::stdout().flush();
            if let Err(e) = dev.motor_on(side, track) {
                result = Err(e);
                break 'tracks;
            }
            let filename = track_filename(&cfg.basename, track, side);
            if let Err(e) = capture_track(dev, Path::new(&filename)) {
                result = Err(e);
                break 'tracks;
            }
            println!("ok");
        }
    }
    let off = dev.motor_off();
    result.and(off)
}

pub fn track_filename(base: &str, track: u8, side: u8) -> String {
    format!("{base}{track:02}.{side}.raw")
}

/// Captures a single track into `path`.
///
/// The file receives the host preamble record followed by the verbatim
/// concatenation of every accepted chunk; the decoder runs alongside purely
/// as a validator and never alters what is written.
pub fn capture_track(dev: &dyn CaptureDevice, path: &Path) -> io::Result<()> {
    let mut file = File::create(path).map_err(|e| {
        error!("{}: {e}", path.display());
        e
    })?;
    write_preamble(&mut file)?;

    let mut decoder = StreamDecoder::new();
    let mut transfer_failed = false;

    let run = {
        let file = &mut file;
        let decoder = &mut decoder;
        let transfer_failed = &mut transfer_failed;
        dev.stream_capture(&mut move |data| -> bool {
            if decoder.is_complete() || decoder.is_failed() || *transfer_failed {
                return false;
            }
            let Some(data) = data else {
                *transfer_failed = true;
                return false;
            };
            if data.is_empty() {
                return true;
            }
            if let Err(e) = decoder.feed(data) {
                error!("stream validation failed: {e}");
                return false;
            }
            if let Err(e) = file.write_all(data) {
                error!("failed to write data to file: {e}");
                *transfer_failed = true;
                return false;
            }
            !decoder.is_complete()
        })
    };

    let close = file.sync_all().map_err(|e| {
        error!("{}: {e}", path.display());
        e
    });
    run?;
    close?;

    if transfer_failed || decoder.is_failed() || !decoder.is_complete() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "capture ended without a complete stream",
        ));
    }
    Ok(())
}

/// Writes the host timestamp preamble: an OOB record of type 4 whose payload
/// is the null-terminated `host_date=…, host_time=…` string.
fn write_preamble(out: &mut dyn Write) -> io::Result<()> {
    let stamp = Local::now()
        .format("host_date=%Y.%m.%d, host_time=%H:%M:%S")
        .to_string();
    write_preamble_text(out, &stamp)
}

fn write_preamble_text(out: &mut dyn Write, text: &str) -> io::Result<()> {
    let size = text.len() + 1;
    // The size always fits the low byte: the timestamp payload stays far
    // below 256 bytes.
    let header = [0x0d, 0x04, size as u8, 0x00];
    out.write_all(&header)?;
    out.write_all(text.as_bytes())?;
    out.write_all(&[0])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideMode;
    use std::cell::RefCell;
    use std::path::PathBuf;

    fn stream_end(pos: u32, result: u32) -> Vec<u8> {
        let mut rec = vec![0x0d, 0x03, 0x08, 0x00];
        rec.extend_from_slice(&pos.to_le_bytes());
        rec.extend_from_slice(&result.to_le_bytes());
        rec
    }

    fn stream_index(pos: u32) -> Vec<u8> {
        let mut rec = vec![0x0d, 0x01, 0x0c, 0x00];
        rec.extend_from_slice(&pos.to_le_bytes());
        rec.extend_from_slice(&[0; 8]);
        rec
    }

    const SENTINEL: [u8; 4] = [0x0d, 0x0d, 0x0d, 0x0d];

    /// Scripted device: hands the prepared chunks to the consumer in order,
    /// recording each motor/stream call.
    struct ScriptedDevice {
        chunks: Vec<Option<Vec<u8>>>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedDevice {
        fn new(chunks: Vec<Option<Vec<u8>>>) -> Self {
            ScriptedDevice {
                chunks,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn motor_on(&self, side: u8, track: u8) -> io::Result<()> {
            self.calls.borrow_mut().push(format!("motor_on {track}.{side}"));
            Ok(())
        }

        fn motor_off(&self) -> io::Result<()> {
            self.calls.borrow_mut().push("motor_off".into());
            Ok(())
        }

        fn stream_capture(
            &self,
            consumer: &mut dyn FnMut(Option<&[u8]>) -> bool,
        ) -> io::Result<()> {
            self.calls.borrow_mut().push("stream_on".into());
            for chunk in &self.chunks {
                if !consumer(chunk.as_deref()) {
                    break;
                }
            }
            self.calls.borrow_mut().push("stream_off".into());
            Ok(())
        }
    }

    /// A well-formed capture: 1000 single-byte samples, an index checkpoint,
    /// the end-of-stream record, and the sentinel.
    fn good_chunks() -> Vec<Option<Vec<u8>>> {
        let mut tail = stream_index(1000);
        tail.extend(stream_end(1000, 0));
        tail.extend(SENTINEL);
        vec![
            Some(vec![0x50; 600]),
            Some(vec![]),
            Some(vec![0x50; 400]),
            Some(tail),
        ]
    }

    fn scripted_len(chunks: &[Option<Vec<u8>>]) -> usize {
        chunks.iter().flatten().map(|c| c.len()).sum()
    }

    #[test]
    fn capture_writes_preamble_then_chunks_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap00.0.raw");
        let chunks = good_chunks();
        let payload_len = scripted_len(&chunks);
        let dev = ScriptedDevice::new(chunks.clone());

        capture_track(&dev, &path).unwrap();

        let contents = std::fs::read(&path).unwrap();
        // preamble: 4-byte header + null-terminated timestamp payload
        assert_eq!(contents[0], 0x0d);
        assert_eq!(contents[1], 0x04);
        let size = contents[2] as usize | ((contents[3] as usize) << 8);
        let preamble_len = 4 + size;
        assert_eq!(contents[preamble_len - 1], 0);
        assert!(
            std::str::from_utf8(&contents[4..preamble_len - 1])
                .unwrap()
                .starts_with("host_date=")
        );
        assert_eq!(contents.len(), preamble_len + payload_len);

        // the tail after the preamble is exactly the concatenated chunks
        let expected: Vec<u8> = chunks.iter().flatten().flatten().copied().collect();
        assert_eq!(&contents[preamble_len..], &expected[..]);

        // and it re-validates as a stream in its own right
        let mut dec = StreamDecoder::new();
        dec.feed(&contents[preamble_len..]).unwrap();
        assert!(dec.is_complete());
        assert_eq!(dec.streampos(), 1000);
    }

    #[test]
    fn transfer_error_fails_the_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.raw");
        let dev = ScriptedDevice::new(vec![Some(vec![0x50; 10]), None]);

        assert!(capture_track(&dev, &path).is_err());
        // bytes delivered before the error were still persisted verbatim
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[contents.len() - 10..], &[0x50; 10]);
    }

    #[test]
    fn malformed_stream_fails_the_track_and_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.raw");
        // position checkpoint disagrees with the byte count
        let mut tail = stream_end(3, 0);
        tail.extend(SENTINEL);
        let dev = ScriptedDevice::new(vec![Some(vec![0x50; 10]), Some(tail)]);

        assert!(capture_track(&dev, &path).is_err());
        // the offending chunk is rejected before it reaches the file
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[contents.len() - 10..], &[0x50; 10]);
    }

    #[test]
    fn missing_sentinel_fails_the_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raw");
        let dev = ScriptedDevice::new(vec![Some(vec![0x50; 4])]);
        assert!(capture_track(&dev, &path).is_err());
    }

    #[test]
    fn preamble_layout_matches_the_on_wire_format() {
        let mut out = Vec::new();
        write_preamble_text(&mut out, "host_date=2013.05.01, host_time=12:00:00").unwrap();
        assert_eq!(out[0], 0x0d);
        assert_eq!(out[1], 0x04);
        assert_eq!(out[2], 41); // 40 chars + terminating null
        assert_eq!(out[3], 0);
        assert_eq!(out.len(), 4 + 41);
        assert_eq!(*out.last().unwrap(), 0);
    }

    #[test]
    fn track_filenames_use_two_digit_track_and_one_digit_side() {
        assert_eq!(track_filename("disk", 3, 1), "disk03.1.raw");
        assert_eq!(track_filename("out/img", 82, 0), "out/img82.0.raw");
    }

    #[test]
    fn capture_tracks_walks_sides_and_parks_the_motor() {
        let dir = tempfile::tempdir().unwrap();
        let base: PathBuf = dir.path().join("t");
        let dev = ScriptedDevice::new(good_chunks());
        let cfg = CaptureConfig {
            basename: base.to_str().unwrap().to_string(),
            drive: 0,
            density: 0,
            min_track: 0,
            max_track: 83,
            start_track: 0,
            end_track: 1,
            side_mode: SideMode::Both,
            track_step: 1,
            firmware_path: "firmware.bin".into(),
        };

        capture_tracks(&dev, &cfg).unwrap();

        let calls = dev.calls.borrow();
        let motor_ons: Vec<_> = calls.iter().filter(|c| c.starts_with("motor_on")).collect();
        assert_eq!(
            motor_ons,
            ["motor_on 0.0", "motor_on 0.1", "motor_on 1.0", "motor_on 1.1"]
        );
        assert_eq!(calls.last().unwrap(), "motor_off");
        for track in 0..=1 {
            for side in 0..=1 {
                assert!(dir.path().join(format!("t{track:02}.{side}.raw")).exists());
            }
        }
    }

    #[test]
    fn single_side_mode_skips_the_other_side() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("s");
        let dev = ScriptedDevice::new(good_chunks());
        let cfg = CaptureConfig {
            basename: base.to_str().unwrap().to_string(),
            drive: 0,
            density: 0,
            min_track: 0,
            max_track: 83,
            start_track: 4,
            end_track: 8,
            side_mode: SideMode::Side1,
            track_step: 2,
            firmware_path: "firmware.bin".into(),
        };

        capture_tracks(&dev, &cfg).unwrap();

        for track in [4u8, 6, 8] {
            assert!(dir.path().join(format!("s{track:02}.1.raw")).exists());
            assert!(!dir.path().join(format!("s{track:02}.0.raw")).exists());
        }
        assert!(!dir.path().join("s05.1.raw").exists());
    }

    #[test]
    fn failed_capture_still_parks_the_motor() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("f");
        let dev = ScriptedDevice::new(vec![Some(vec![0x50; 4]), None]);
        let cfg = CaptureConfig {
            basename: base.to_str().unwrap().to_string(),
            drive: 0,
            density: 0,
            min_track: 0,
            max_track: 83,
            start_track: 0,
            end_track: 3,
            side_mode: SideMode::Side0,
            track_step: 1,
            firmware_path: "firmware.bin".into(),
        };

        assert!(capture_tracks(&dev, &cfg).is_err());
        let calls = dev.calls.borrow();
        assert_eq!(calls.last().unwrap(), "motor_off");
        // the run stopped at the first failed track
        assert_eq!(calls.iter().filter(|c| c.starts_with("motor_on")).count(), 1);
    }
}
