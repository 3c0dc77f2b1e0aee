//! Wire-format laws: framing, length prefixes, and reader/writer
//! agreement.

use std::io::Cursor;

use datagrind::record::{
    length_prefix_size, RecordKind, RecordReader, TraceWriter, Word, ENDIAN_LITTLE, MAGIC,
    TRACE_VERSION, WORD_SIZE,
};

/// Write one record with the given payload and read the whole stream
/// back, returning (kind, payload) pairs after the header.
fn round_trip(kind: RecordKind, payload: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut writer = TraceWriter::new(Vec::new()).unwrap();
    writer.begin_record(kind, payload.len() as u64).unwrap();
    writer.put_bytes(payload).unwrap();
    let bytes = writer.close().unwrap();

    let mut reader = RecordReader::new(Cursor::new(bytes));
    let mut records = Vec::new();
    while let Some(mut record) = reader.next_record().unwrap() {
        let len = record.len() as usize;
        let body = record.bytes(len).unwrap().to_vec();
        records.push((record.kind_byte(), body));
    }
    records
}

#[test]
fn header_is_first_and_bit_exact() {
    let records = round_trip(RecordKind::FreeBlock, &[0u8; WORD_SIZE]);
    let (kind, body) = &records[0];
    assert_eq!(*kind, RecordKind::Header as u8);
    assert_eq!(body.len(), 14);
    assert_eq!(&body[..11], MAGIC);
    assert_eq!(body[11], TRACE_VERSION);
    assert_eq!(body[12], ENDIAN_LITTLE);
    assert_eq!(body[13], WORD_SIZE as u8);
}

#[test]
fn payloads_survive_round_trip() {
    let payload: Vec<u8> = (0..=200).collect();
    let records = round_trip(RecordKind::BbDef, &payload);
    assert_eq!(records[1], (RecordKind::BbDef as u8, payload));
}

#[test]
fn length_prefix_is_one_byte_up_to_254() {
    for len in [0usize, 1, 254] {
        let payload = vec![0x11u8; len];
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.begin_record(RecordKind::BbRun, len as u64).unwrap();
        writer.put_bytes(&payload).unwrap();
        let bytes = writer.close().unwrap();
        // header record is 2 + 14 bytes
        let frame = &bytes[16..];
        assert_eq!(frame.len(), 1 + 1 + len);
        assert_eq!(frame[1] as usize, len);
        assert_eq!(length_prefix_size(len as u64), 1);
    }
}

#[test]
fn length_prefix_escapes_at_255() {
    for len in [255usize, 256, 70_000] {
        let payload = vec![0x22u8; len];
        let mut writer = TraceWriter::new(Vec::new()).unwrap();
        writer.begin_record(RecordKind::BbRun, len as u64).unwrap();
        writer.put_bytes(&payload).unwrap();
        let bytes = writer.close().unwrap();
        let frame = &bytes[16..];
        assert_eq!(frame.len(), 1 + 1 + WORD_SIZE + len);
        assert_eq!(frame[1], 255);
        let declared = Word::from_le_bytes(frame[2..2 + WORD_SIZE].try_into().unwrap());
        assert_eq!(declared as usize, len);
        assert_eq!(length_prefix_size(len as u64), 1 + WORD_SIZE);

        // And the reader agrees.
        let mut reader = RecordReader::new(Cursor::new(bytes));
        let _header = reader.next_record().unwrap().unwrap();
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.len() as usize, len);
    }
}

#[test]
fn words_are_little_endian() {
    let mut writer = TraceWriter::new(Vec::new()).unwrap();
    writer
        .begin_record(RecordKind::FreeBlock, WORD_SIZE as u64)
        .unwrap();
    writer.put_word(0x0102_0304_0506_0708).unwrap();
    let bytes = writer.close().unwrap();
    assert_eq!(
        &bytes[18..],
        &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
    );

    let mut reader = RecordReader::new(Cursor::new(bytes));
    let _header = reader.next_record().unwrap().unwrap();
    let mut record = reader.next_record().unwrap().unwrap();
    assert_eq!(record.word().unwrap(), 0x0102_0304_0506_0708);
}

#[test]
fn many_records_stream_in_order() {
    let mut writer = TraceWriter::new(Vec::new()).unwrap();
    for i in 0..5000u64 {
        writer
            .begin_record(RecordKind::FreeBlock, WORD_SIZE as u64)
            .unwrap();
        writer.put_word(i).unwrap();
    }
    let bytes = writer.close().unwrap();

    let mut reader = RecordReader::new(Cursor::new(bytes));
    let _header = reader.next_record().unwrap().unwrap();
    let mut seen = 0u64;
    while let Some(mut record) = reader.next_record().unwrap() {
        assert_eq!(record.kind_byte(), RecordKind::FreeBlock as u8);
        assert_eq!(record.word().unwrap(), seen);
        record.finish().unwrap();
        seen += 1;
    }
    assert_eq!(seen, 5000);
}
