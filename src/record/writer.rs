//! Buffered trace emitter.

use std::io::{self, Write};

use crate::record::{RecordKind, Word, ENDIAN_LITTLE, MAGIC, TRACE_VERSION, WORD_SIZE};

const OUT_BUF_SIZE: usize = 4096;

/// Writes framed records through a 4 KiB buffer.
///
/// The header record is written immediately on construction, so a trace
/// file is well-formed from its first flush. The producer runs inside an
/// instrumentation host that serialises all calls; the writer is plain
/// mutable state with no interior locking.
pub struct TraceWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> TraceWriter<W> {
    /// Open a writer and emit the header record.
    pub fn new(inner: W) -> io::Result<Self> {
        let mut writer = Self {
            inner,
            buf: Vec::with_capacity(OUT_BUF_SIZE),
        };
        writer.begin_record(RecordKind::Header, (MAGIC.len() + 3) as u64)?;
        writer.put_bytes(MAGIC)?;
        writer.put_u8(TRACE_VERSION)?;
        writer.put_u8(ENDIAN_LITTLE)?;
        writer.put_u8(WORD_SIZE as u8)?;
        Ok(writer)
    }

    /// Write a record frame: type byte plus length prefix. The caller
    /// must follow with exactly `payload_len` bytes of `put_*` calls.
    pub fn begin_record(&mut self, kind: RecordKind, payload_len: u64) -> io::Result<()> {
        self.put_u8(kind as u8)?;
        if payload_len < 255 {
            self.put_u8(payload_len as u8)
        } else {
            self.put_u8(255)?;
            self.put_word(payload_len)
        }
    }

    pub fn put_u8(&mut self, byte: u8) -> io::Result<()> {
        if self.buf.len() >= OUT_BUF_SIZE {
            self.flush()?;
        }
        self.buf.push(byte);
        Ok(())
    }

    pub fn put_word(&mut self, word: Word) -> io::Result<()> {
        self.put_bytes(&word.to_le_bytes())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > OUT_BUF_SIZE - self.buf.len() {
            self.flush()?;
        }
        if bytes.len() >= OUT_BUF_SIZE {
            // Oversized payloads bypass the buffer.
            return self.inner.write_all(bytes);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a string field: the bytes followed by a NUL terminator.
    pub fn put_str(&mut self, s: &[u8]) -> io::Result<()> {
        self.put_bytes(s)?;
        self.put_u8(0)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()
    }

    /// Flush and return the underlying sink.
    pub fn close(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::length_prefix_size;

    fn header_bytes() -> Vec<u8> {
        let mut expected = vec![RecordKind::Header as u8, 14];
        expected.extend_from_slice(MAGIC);
        expected.extend_from_slice(&[TRACE_VERSION, ENDIAN_LITTLE, WORD_SIZE as u8]);
        expected
    }

    #[test]
    fn header_written_on_open() {
        let writer = TraceWriter::new(Vec::new()).unwrap();
        assert_eq!(writer.close().unwrap(), header_bytes());
    }

    #[test]
    fn short_record_has_one_byte_prefix() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.begin_record(RecordKind::FreeBlock, WORD_SIZE as u64).unwrap();
        writer.put_word(0xdead).unwrap();
        let out = writer.close().unwrap();
        let body = &out[header_bytes().len()..];
        assert_eq!(body[0], RecordKind::FreeBlock as u8);
        assert_eq!(body[1], WORD_SIZE as u8);
        assert_eq!(body.len(), 1 + length_prefix_size(8) + WORD_SIZE);
    }

    #[test]
    fn long_record_has_escaped_prefix() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        let payload = vec![0x5au8; 1000];
        writer.begin_record(RecordKind::BbRun, payload.len() as u64).unwrap();
        writer.put_bytes(&payload).unwrap();
        let out = writer.close().unwrap();
        let body = &out[header_bytes().len()..];
        assert_eq!(body[0], RecordKind::BbRun as u8);
        assert_eq!(body[1], 255);
        assert_eq!(Word::from_le_bytes(body[2..10].try_into().unwrap()), 1000);
        assert_eq!(&body[10..], &payload[..]);
    }

    #[test]
    fn buffer_flushes_across_many_records() {
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        for i in 0..2000u64 {
            writer.begin_record(RecordKind::FreeBlock, WORD_SIZE as u64).unwrap();
            writer.put_word(i).unwrap();
        }
        let out = writer.close().unwrap();
        assert_eq!(out.len(), header_bytes().len() + 2000 * (2 + WORD_SIZE));
    }
}
