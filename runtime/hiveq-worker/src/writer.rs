use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;

/// Newline-delimited JSON result file that tracks lines and bytes written.
pub struct ResultFileWriter<W: Write> {
    out: W,
    line_number: u64,
    bytes: u64,
}

impl ResultFileWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> ResultFileWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            line_number: 0,
            bytes: 0,
        }
    }

    /// Appends `value` as one JSON line and returns the bytes it took,
    /// trailing newline included.
    pub fn write_line<T: Serialize + ?Sized>(&mut self, value: &T) -> io::Result<u64> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.out.write_all(&line)?;
        let written = line.len() as u64;
        self.line_number += 1;
        self.bytes += written;
        Ok(written)
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
