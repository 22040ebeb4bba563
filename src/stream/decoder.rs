use std::io;

/// Incremental validator for the KryoFlux on-wire stream.
///
/// Bytes are classified by their first value: `0x00..=0x07` opens a two-byte
/// cell value, `0x08..=0x0a` are one- to three-byte nops, `0x0b` is a
/// single-byte overflow marker, `0x0c` a three-byte 16-bit value, `0x0e..`
/// single-byte samples, and `0x0d` introduces an out-of-band record
/// (`0x0d, type, size_lo, size_hi, payload`). OOB payload bytes never count
/// towards the stream position; everything else advances it by its full token
/// length.
///
/// The decoder is fed the exact chunks the USB transport delivers. A non-OOB
/// token may be split across a chunk boundary; the missing byte count is
/// carried in `skipcount` and consumed, unclassified, at the start of the
/// next chunk. OOB records are transmitted whole by the device, so a record
/// that does not fit its chunk is a stream error, not a carry-over.
pub struct StreamDecoder {
    /// Count of parsed stream bytes, excluding OOB record bodies.
    streampos: u64,
    /// Remainder of a token that spilled past the current chunk.
    skipcount: usize,
    /// Set once a type-3 (stream end) record was seen.
    result_found: bool,
    /// Set by the end-of-data sentinel, only valid with `result_found`.
    complete: bool,
    /// Set on any structural error; terminal.
    failed: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder {
            streampos: 0,
            skipcount: 0,
            result_found: false,
            complete: false,
            failed: false,
        }
    }

    pub fn reset(&mut self) {
        *self = StreamDecoder::new();
    }

    pub fn streampos(&self) -> u64 {
        self.streampos
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Validates one delivered chunk. On a structural error the decoder marks
    /// itself failed and stays failed; on success, position bookkeeping is
    /// ready for the next chunk. Once the end-of-data sentinel has been
    /// accepted the remainder of the chunk is not consumed.
    pub fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        match self.parse(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn parse(&mut self, data: &[u8]) -> io::Result<()> {
        let mut i = 0usize;

        // Tail of a token that ran past the previous chunk.
        if self.skipcount > 0 {
            let n = self.skipcount.min(data.len());
            self.skipcount -= n;
            self.streampos += n as u64;
            i = n;
        }

        while i < data.len() {
            let remaining = data.len() - i;
            let need = match data[i] {
                0x00..=0x07 => 2,                         // Value: low then high byte
                0x08..=0x0a => (data[i] - 0x07) as usize, // Nop1..Nop3
                0x0b => 1,                                // Overflow16
                0x0c => 3,                                // Value16
                0x0d => {
                    i = self.oob_record(data, i)?;
                    if self.complete {
                        return Ok(());
                    }
                    continue;
                }
                _ => 1, // Sample
            };
            if remaining < need {
                self.streampos += remaining as u64;
                self.skipcount = need - remaining;
                return Ok(());
            }
            self.streampos += need as u64;
            i += need;
        }
        Ok(())
    }

    /// Validates the OOB record starting at `start` and returns the index of
    /// the first byte after it.
    fn oob_record(&mut self, data: &[u8], start: usize) -> io::Result<usize> {
        let rec = &data[start..];
        if rec.len() < 4 {
            return Err(stream_error("no room for OOB header"));
        }
        let kind = rec[1];
        let size = rec[2] as usize | ((rec[3] as usize) << 8);

        if kind == 0x0d && size == 0x0d0d {
            if !self.result_found {
                return Err(stream_error(
                    "end of data marker encountered before end of stream marker",
                ));
            }
            self.complete = true;
            return Ok(start);
        }

        if rec.len() - 4 < size {
            return Err(stream_error("no room for OOB data"));
        }
        let payload = &rec[4..4 + size];

        // Stream index (1) and stream end (3) records carry a position
        // checkpoint that must match our own count.
        if kind == 1 || kind == 3 {
            if size < 4 {
                return Err(stream_error("no room for stream position"));
            }
            let pos = u32::from_le_bytes(payload[..4].try_into().unwrap()) as u64;
            if pos != self.streampos {
                return Err(stream_error(format!(
                    "bad stream position {pos} != {}",
                    self.streampos
                )));
            }
        }

        if kind == 3 {
            if size < 8 {
                return Err(stream_error("no room for result value"));
            }
            self.result_found = true;
            let result = u32::from_le_bytes(payload[4..8].try_into().unwrap());
            match result {
                0 => {}
                1 => {
                    return Err(stream_error(
                        "buffering problem - data transfer delivery to host \
                         could not keep up with disk read",
                    ));
                }
                2 => return Err(stream_error("no index signal detected")),
                other => return Err(stream_error(format!("unknown stream end result {other}"))),
            }
        }

        Ok(start + 4 + size)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        StreamDecoder::new()
    }
}

fn stream_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
