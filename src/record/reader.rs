//! Streaming record reader and typed payload extractors.

use std::io::{ErrorKind, Read};

use tracing::warn;

use crate::error::{ContentError, TraceError};
use crate::record::{Word, WORD_SIZE};

/// Pulls one record at a time off a trace stream.
///
/// The reader distinguishes three terminal conditions: a clean end of
/// stream before a record begins (yields `None`), a record truncated by
/// the end of the file (logged, then `None`, so traces cut short by a
/// crashing guest are recovered up to the last whole record), and an I/O
/// error (surfaced as fatal).
pub struct RecordReader<R> {
    inner: R,
    payload: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            payload: Vec::new(),
        }
    }

    /// Read the next record, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<Record<'_>>, TraceError> {
        let mut kind = [0u8; 1];
        match self.inner.read_exact(&mut kind) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = match self.read_length() {
            Ok(len) => len,
            Err(TraceError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!("trace truncated inside a record frame; stopping at last whole record");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.payload.clear();
        // A corrupt length must not translate into a giant reservation;
        // read_to_end grows as real bytes arrive.
        self.payload.reserve(len.min(1 << 16) as usize);
        let copied = (&mut self.inner)
            .take(len)
            .read_to_end(&mut self.payload)?;
        if (copied as u64) < len {
            warn!(
                expected = len,
                got = copied,
                "trace truncated inside a record payload; stopping at last whole record"
            );
            return Ok(None);
        }

        Ok(Some(Record {
            kind: kind[0],
            payload: &self.payload,
            offset: 0,
        }))
    }

    fn read_length(&mut self) -> Result<u64, TraceError> {
        let mut small = [0u8; 1];
        self.inner.read_exact(&mut small)?;
        if small[0] < 255 {
            return Ok(u64::from(small[0]));
        }
        let mut wide = [0u8; WORD_SIZE];
        self.inner.read_exact(&mut wide)?;
        Ok(Word::from_le_bytes(wide))
    }
}

/// One framed record with extractors that advance an offset against the
/// declared payload length.
pub struct Record<'a> {
    kind: u8,
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Record<'a> {
    /// Raw type byte as it appeared on the wire.
    pub fn kind_byte(&self) -> u8 {
        self.kind
    }

    /// Declared payload length.
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Bytes not yet consumed by an extractor.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    pub fn byte(&mut self) -> Result<u8, ContentError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn word(&mut self) -> Result<Word, ContentError> {
        let raw = self.bytes(WORD_SIZE)?;
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(raw);
        Ok(Word::from_le_bytes(buf))
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ContentError> {
        if len > self.remaining() {
            return Err(ContentError::TooShort {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        let out = &self.payload[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Consume up to and including a NUL terminator.
    ///
    /// Labels and filenames are written by the guest and are not
    /// guaranteed to be UTF-8; invalid sequences are replaced.
    pub fn string(&mut self) -> Result<String, ContentError> {
        let rest = &self.payload[self.offset..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ContentError::UnterminatedString)?;
        self.offset += nul + 1;
        Ok(String::from_utf8_lossy(&rest[..nul]).into_owned())
    }

    /// Check that the record was fully consumed.
    pub fn finish(&self) -> Result<(), ContentError> {
        if self.offset as u64 != self.len() {
            return Err(ContentError::TrailingBytes {
                consumed: self.offset as u64,
                declared: self.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn short_prefix_framing() {
        // type 7, len 3, payload [1, 2, 3]
        let data = [7u8, 3, 1, 2, 3];
        let mut reader = RecordReader::new(Cursor::new(data));
        let mut rec = reader.next_record().unwrap().unwrap();
        assert_eq!(rec.kind_byte(), 7);
        assert_eq!(rec.len(), 3);
        assert_eq!(rec.bytes(3).unwrap(), &[1, 2, 3]);
        rec.finish().unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn wide_prefix_framing() {
        let mut data = vec![9u8, 255];
        data.extend_from_slice(&300u64.to_le_bytes());
        data.extend(std::iter::repeat(0xab).take(300));
        let mut reader = RecordReader::new(Cursor::new(data));
        let rec = reader.next_record().unwrap().unwrap();
        assert_eq!(rec.kind_byte(), 9);
        assert_eq!(rec.len(), 300);
    }

    #[test]
    fn truncated_payload_ends_stream() {
        let data = [7u8, 10, 1, 2];
        let mut reader = RecordReader::new(Cursor::new(data));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn truncated_frame_ends_stream() {
        let data = [7u8];
        let mut reader = RecordReader::new(Cursor::new(data));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn extractors_bound_by_declared_length() {
        let data = [7u8, 2, 1, 2];
        let mut reader = RecordReader::new(Cursor::new(data));
        let mut rec = reader.next_record().unwrap().unwrap();
        assert_eq!(rec.byte().unwrap(), 1);
        assert!(matches!(
            rec.word(),
            Err(ContentError::TooShort { wanted: 8, remaining: 1 })
        ));
    }

    #[test]
    fn string_requires_terminator() {
        let data = [3u8, 3, b'a', b'b', b'c'];
        let mut reader = RecordReader::new(Cursor::new(data));
        let mut rec = reader.next_record().unwrap().unwrap();
        assert!(matches!(rec.string(), Err(ContentError::UnterminatedString)));
    }

    #[test]
    fn finish_flags_unconsumed_payload() {
        let data = [3u8, 4, b'a', 0, b'x', b'y'];
        let mut reader = RecordReader::new(Cursor::new(data));
        let mut rec = reader.next_record().unwrap().unwrap();
        assert_eq!(rec.string().unwrap(), "a");
        assert!(matches!(
            rec.finish(),
            Err(ContentError::TrailingBytes { consumed: 2, declared: 4 })
        ));
    }
}
