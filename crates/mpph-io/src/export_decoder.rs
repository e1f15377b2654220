//! Incremental decoder for the Mixpanel raw export format.
//!
//! The export body is a run of concatenated JSON objects (one per line in
//! practice) with no enclosing array, so it can be decoded unit by unit while
//! bytes are still arriving. Running out of bytes between units is a normal
//! end of stream; running out inside a unit, or any malformed unit, is fatal.

use std::io::Read;

use mpph_core::{DecodeError, Message, NormalizedEvent, RawEventRecord, RecordTx};
use mpph_tx::EventTransformer;

const READ_CHUNK: usize = 64 * 1024;

/// Push-style decoder: feed it bytes, pull complete records out.
#[derive(Debug, Default)]
pub struct ExportDecoder {
    buf: Vec<u8>,
    /// Start of the undecoded region in `buf`
    pos: usize,
    /// Bytes already discarded from the front of `buf`
    discarded: u64,
    /// Set while the unit at `pos` is known incomplete; bytes before
    /// `scanned` have already been checked for a closing bracket
    stalled: bool,
    scanned: usize,
    /// Parse attempts, for tests
    attempts: usize,
    units: usize,
}

impl ExportDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next chunk of the stream
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.pos > 0 && self.pos * 2 >= self.buf.len() {
            self.buf.drain(..self.pos);
            self.discarded += self.pos as u64;
            self.scanned = self.scanned.saturating_sub(self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete unit.
    ///
    /// `Ok(None)` means the buffered bytes do not hold a complete unit yet.
    /// An incomplete unit is only re-parsed once a closing bracket arrives,
    /// so a unit split over many small chunks is not parsed once per chunk.
    pub fn next_record(&mut self) -> Result<Option<RawEventRecord>, DecodeError> {
        if self.stalled {
            let start = self.scanned.max(self.pos);
            let closed = self.buf[start..].iter().any(|b| matches!(b, b'}' | b']'));
            self.scanned = self.buf.len();
            if !closed {
                return Ok(None);
            }
            self.stalled = false;
        }

        self.attempts += 1;
        let outcome = {
            let pending = &self.buf[self.pos..];
            let mut stream =
                serde_json::Deserializer::from_slice(pending).into_iter::<RawEventRecord>();
            match stream.next() {
                // only whitespace left
                None => Ok(None),
                Some(Ok(record)) => Ok(Some((record, stream.byte_offset()))),
                Some(Err(e)) if e.is_eof() => {
                    self.stalled = true;
                    self.scanned = self.buf.len();
                    return Ok(None);
                }
                Some(Err(e)) => Err(e),
            }
        };

        match outcome {
            Ok(None) => {
                self.pos = self.buf.len();
                Ok(None)
            }
            Ok(Some((record, consumed))) => {
                self.pos += consumed;
                self.units += 1;
                Ok(Some(record))
            }
            Err(source) => Err(DecodeError::Malformed {
                unit: self.units + 1,
                offset: self.discarded + self.pos as u64,
                source,
            }),
        }
    }

    /// Declare end of stream. Fails if a partial unit is still buffered.
    pub fn finish(&self) -> Result<(), DecodeError> {
        let pending = &self.buf[self.pos..];
        if pending.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(DecodeError::Truncated {
                unit: self.units + 1,
                pending: pending.len(),
            })
        }
    }

    /// Units decoded so far
    pub fn units(&self) -> usize {
        self.units
    }
}

/// Forward every complete buffered unit downstream.
///
/// Returns `Ok(false)` once the downstream channel is closed.
pub(crate) async fn forward_decoded(
    decoder: &mut ExportDecoder,
    tx: &RecordTx,
) -> Result<bool, DecodeError> {
    while let Some(record) = decoder.next_record()? {
        if tx.send(Message::RawEvent(record)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Blocking iterator over the units of an export stream.
pub struct ExportReader<R> {
    reader: R,
    decoder: ExportDecoder,
    chunk: Vec<u8>,
    done: bool,
}

/// Decode an export stream from any reader, one unit at a time.
pub fn decode_export<R: Read>(reader: R) -> ExportReader<R> {
    ExportReader {
        reader,
        decoder: ExportDecoder::new(),
        chunk: vec![0; READ_CHUNK],
        done: false,
    }
}

impl<R: Read> Iterator for ExportReader<R> {
    type Item = Result<RawEventRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.decoder.next_record() {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }

            let read = match self.reader.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if read == 0 {
                self.done = true;
                return self.decoder.finish().err().map(Err);
            }
            self.decoder.feed(&self.chunk[..read]);
        }
    }
}

/// A decode failure, together with every event transformed before it.
#[derive(Debug, thiserror::Error)]
#[error("export failed after {} transformed events: {error}", .events.len())]
pub struct PartialExport {
    pub events: Vec<NormalizedEvent>,
    #[source]
    pub error: DecodeError,
}

/// Decode and transform a whole export stream.
///
/// Records missing required fields are skipped; a decode error fails the
/// export but hands back what was transformed before it.
pub fn transform_export<R: Read>(
    reader: R,
    transformer: &EventTransformer,
) -> Result<Vec<NormalizedEvent>, PartialExport> {
    let mut events = Vec::new();
    for unit in decode_export(reader) {
        match unit {
            Ok(raw) => events.extend(transformer.transform(&raw)),
            Err(error) => return Err(PartialExport { events, error }),
        }
    }
    Ok(events)
}
