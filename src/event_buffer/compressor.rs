use std::io::{self, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Incrementally compresses a JSON array of events.
///
/// Each event is written as soon as it arrives; `finish` closes the array,
/// returns the zlib stream and starts a new one.
pub struct Compressor {
    encoder: ZlibEncoder<Vec<u8>>,
    has_events: bool,
}

impl Compressor {
    pub fn new() -> io::Result<Self> {
        let mut compressor = Self {
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
            has_events: false,
        };
        compressor.encoder.write_all(b"[")?;
        Ok(compressor)
    }

    pub fn clear(&mut self) -> io::Result<()> {
        *self = Self::new()?;
        Ok(())
    }

    /// Appends one already serialized event.
    pub fn add_event(&mut self, data: &str) -> io::Result<()> {
        if self.has_events {
            self.encoder.write_all(b",")?;
        }
        self.encoder.write_all(data.as_bytes())?;
        self.has_events = true;
        Ok(())
    }

    pub fn finish(&mut self) -> io::Result<Vec<u8>> {
        self.encoder.write_all(b"]")?;
        let fresh = Self::new()?;
        let done = std::mem::replace(self, fresh);
        done.encoder.finish()
    }
}
