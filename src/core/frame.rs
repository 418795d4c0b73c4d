// Binary row frame: fixed header, column names, then rows of tagged cells, each row
// opened by a row marker byte.
use crate::core::error::{Error, ErrorKind};
use crate::core::row::{Cell, ResultSet, Row};

pub const FRAME_MAGIC: [u8; 4] = *b"RRW1";
pub const FRAME_VERSION: u32 = 1;
pub const SUPPORTED_FRAME_VERSIONS: &[u32] = &[FRAME_VERSION];
pub const FRAME_HEADER_LEN: usize = 48;
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024 * 1024;

const TAG_NULL: u8 = 0;
const TAG_TEXT: u8 = 1;
const ROW_MARKER: u8 = 0xA5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub version: u32,
    pub flags: u32,
    pub header_len: u32,
    pub row_count: u64,
    pub column_count: u32,
    pub body_len: u64,
    pub body_len_xor: u64,
}

impl FrameHeader {
    pub fn new(row_count: u64, column_count: u32, body_len: u64) -> Self {
        Self {
            version: FRAME_VERSION,
            flags: 0,
            header_len: FRAME_HEADER_LEN as u32,
            row_count,
            column_count,
            body_len,
            body_len_xor: body_len ^ u64::MAX,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&FRAME_MAGIC);
        write_u32(&mut buf, 4, self.version);
        write_u32(&mut buf, 8, self.flags);
        write_u32(&mut buf, 12, self.header_len);
        write_u64(&mut buf, 16, self.row_count);
        write_u32(&mut buf, 24, self.column_count);
        write_u64(&mut buf, 32, self.body_len);
        write_u64(&mut buf, 40, self.body_len_xor);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(corrupt("frame header too small"));
        }
        if buf[0..4] != FRAME_MAGIC {
            return Err(corrupt("bad frame magic"));
        }
        Ok(Self {
            version: read_u32(buf, 4),
            flags: read_u32(buf, 8),
            header_len: read_u32(buf, 12),
            row_count: read_u64(buf, 16),
            column_count: read_u32(buf, 24),
            body_len: read_u64(buf, 32),
            body_len_xor: read_u64(buf, 40),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !SUPPORTED_FRAME_VERSIONS.contains(&self.version) {
            return Err(corrupt(format!("unsupported frame version {}", self.version)));
        }
        if self.header_len as usize != FRAME_HEADER_LEN {
            return Err(corrupt("unexpected header length"));
        }
        if self.body_len ^ self.body_len_xor != u64::MAX {
            return Err(corrupt("body length xor mismatch"));
        }
        if self.body_len > (MAX_PAYLOAD_BYTES - FRAME_HEADER_LEN) as u64 {
            return Err(corrupt("body length exceeds max"));
        }
        // Column names cost their length prefix, rows their marker, cells their tag.
        let min_body = self
            .row_count
            .saturating_mul(self.column_count as u64 + 1)
            .saturating_add(self.column_count as u64 * 4);
        if min_body > self.body_len {
            return Err(corrupt("row count does not fit the body"));
        }
        Ok(())
    }
}

pub fn is_frame(buf: &[u8]) -> bool {
    buf.len() >= FRAME_MAGIC.len() && buf[0..4] == FRAME_MAGIC
}

pub fn encode_frame(set: &ResultSet) -> Result<Vec<u8>, Error> {
    if let Some(row) = set.first_ragged_row() {
        return Err(Error::new(ErrorKind::Encoding).with_message(format!(
            "row {row} width differs from the {} result columns",
            set.column_count()
        )));
    }
    let column_count = u32::try_from(set.column_count())
        .map_err(|_| Error::new(ErrorKind::Encoding).with_message("too many columns"))?;

    let mut body = BodyWriter::default();
    for name in set.columns() {
        body.put_str(name)?;
    }
    for row in set.rows() {
        body.put_u8(ROW_MARKER)?;
        for cell in row {
            match cell {
                Cell::Null => body.put_u8(TAG_NULL)?,
                Cell::Text(value) => {
                    body.put_u8(TAG_TEXT)?;
                    body.put_str(value)?;
                }
            }
        }
    }

    let header = FrameHeader::new(set.row_count() as u64, column_count, body.buf.len() as u64);
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.buf.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body.buf);
    Ok(out)
}

pub fn decode_frame(buf: &[u8]) -> Result<ResultSet, Error> {
    let header = FrameHeader::decode(buf)?;
    header.validate()?;

    let body = &buf[FRAME_HEADER_LEN..];
    let body_len = header.body_len as usize;
    if body.len() < body_len {
        return Err(corrupt("frame body truncated"));
    }
    if body.len() > body_len {
        return Err(corrupt("trailing bytes after frame body"));
    }

    let mut reader = BodyReader { buf: body, pos: 0 };
    let column_count = header.column_count as usize;
    let mut columns = Vec::with_capacity(column_count.min(body_len));
    for _ in 0..column_count {
        columns.push(reader.str()?);
    }

    let mut rows: Vec<Row> = Vec::with_capacity((header.row_count as usize).min(body_len));
    for _ in 0..header.row_count {
        match reader.u8()? {
            ROW_MARKER => {}
            marker => return Err(corrupt(format!("bad row marker {marker:#04x}"))),
        }
        let mut row = Vec::with_capacity(column_count.min(body_len));
        for _ in 0..column_count {
            let cell = match reader.u8()? {
                TAG_NULL => Cell::Null,
                TAG_TEXT => Cell::Text(reader.str()?),
                tag => return Err(corrupt(format!("unknown cell tag {tag}"))),
            };
            row.push(cell);
        }
        rows.push(row);
    }
    if reader.pos != body_len {
        return Err(corrupt("frame body has unread bytes"));
    }

    ResultSet::from_rows(columns, rows)
        .map_err(|err| corrupt("frame rows disagree with column count").with_source(err))
}

#[derive(Default)]
struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    fn reserve(&self, extra: usize) -> Result<(), Error> {
        if FRAME_HEADER_LEN + self.buf.len() + extra > MAX_PAYLOAD_BYTES {
            return Err(Error::new(ErrorKind::Encoding)
                .with_message(format!("payload exceeds {MAX_PAYLOAD_BYTES} bytes"))
                .with_hint("Narrow the query (fewer rows or columns) or split it into several runs."));
        }
        Ok(())
    }

    fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        self.reserve(1)?;
        self.buf.push(value);
        Ok(())
    }

    fn put_str(&mut self, value: &str) -> Result<(), Error> {
        let len = u32::try_from(value.len()).map_err(|_| {
            Error::new(ErrorKind::Encoding).with_message("value longer than u32::MAX bytes")
        })?;
        self.reserve(4 + value.len())?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl BodyReader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| corrupt("frame body ends mid-value"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn str(&mut self) -> Result<String, Error> {
        let len = read_u32(self.take(4)?, 0) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| corrupt("value is not valid utf-8").with_source(err))
    }
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Corrupt).with_message(message)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{
        FRAME_HEADER_LEN, FrameHeader, MAX_PAYLOAD_BYTES, decode_frame, encode_frame, is_frame,
    };
    use crate::core::error::ErrorKind;
    use crate::core::row::{Cell, ResultSet};

    fn students() -> ResultSet {
        ResultSet::from_rows(
            vec!["id".into(), "name".into(), "note".into()],
            vec![
                vec![Cell::text("1"), Cell::text("Alice"), Cell::text("")],
                vec![Cell::text("2"), Cell::text("Bob"), Cell::Null],
            ],
        )
        .expect("rows")
    }

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(2, 3, 120);
        let decoded = FrameHeader::decode(&header.encode()).expect("decode");
        assert_eq!(header, decoded);
        decoded.validate().expect("valid");
    }

    #[test]
    fn header_rejects_torn_body_len() {
        let mut header = FrameHeader::new(1, 1, 8);
        header.body_len_xor = 0;
        let err = header.validate().expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn header_rejects_unknown_version() {
        let mut header = FrameHeader::new(0, 0, 0);
        header.version = 9;
        let err = header.validate().expect_err("should fail");
        assert!(err.message().unwrap_or_default().contains("version 9"));
    }

    #[test]
    fn header_rejects_row_count_larger_than_body() {
        let header = FrameHeader::new(1_000, 4, 16);
        let err = header.validate().expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn zero_column_header_cannot_claim_rows_without_body() {
        let header = FrameHeader::new(MAX_PAYLOAD_BYTES as u64, 0, 0);
        let err = decode_frame(&header.encode()).expect_err("hostile header");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(err.message().unwrap_or_default().contains("row count"));
    }

    #[test]
    fn zero_column_rows_round_trip() {
        let set = ResultSet::from_rows(Vec::new(), vec![Vec::new(), Vec::new(), Vec::new()])
            .expect("rows");
        let buf = encode_frame(&set).expect("encode");
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 3);
        assert_eq!(decode_frame(&buf).expect("decode"), set);
    }

    #[test]
    fn bad_row_marker_is_corrupt() {
        let set = ResultSet::from_rows(vec!["c".into()], vec![vec![Cell::Null]])
            .expect("rows");
        let mut buf = encode_frame(&set).expect("encode");
        let marker = FRAME_HEADER_LEN + 4 + 1;
        buf[marker] = 0;
        let err = decode_frame(&buf).expect_err("marker");
        assert!(err.message().unwrap_or_default().contains("row marker"));
    }

    #[test]
    fn frame_preserves_nulls_and_empty_strings() {
        let set = students();
        let buf = encode_frame(&set).expect("encode");
        assert!(is_frame(&buf));
        assert_eq!(decode_frame(&buf).expect("decode"), set);
    }

    #[test]
    fn empty_result_is_header_plus_column_names() {
        let set = ResultSet::new(vec!["id".into()]);
        let buf = encode_frame(&set).expect("encode");
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 4 + 2);
        let decoded = decode_frame(&buf).expect("decode");
        assert_eq!(decoded.row_count(), 0);
        assert_eq!(decoded.columns(), &["id".to_string()]);
    }

    #[test]
    fn ragged_rows_fail_encoding() {
        let set = ResultSet::from_parts_unchecked(
            vec!["a".into(), "b".into()],
            vec![vec![Cell::Null, Cell::Null], vec![Cell::Null]],
        );
        let err = encode_frame(&set).expect_err("ragged");
        assert_eq!(err.kind(), ErrorKind::Encoding);
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let buf = encode_frame(&students()).expect("encode");
        let err = decode_frame(&buf[..buf.len() - 1]).expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let mut buf = encode_frame(&students()).expect("encode");
        buf.push(0);
        let err = decode_frame(&buf).expect_err("trailing");
        assert!(err.message().unwrap_or_default().contains("trailing"));
    }

    #[test]
    fn invalid_utf8_is_corrupt() {
        let set = ResultSet::from_rows(vec!["c".into()], vec![vec![Cell::text("ab")]])
            .expect("rows");
        let mut buf = encode_frame(&set).expect("encode");
        let last = buf.len() - 1;
        buf[last] = 0xFF;
        let err = decode_frame(&buf).expect_err("utf8");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn unknown_cell_tag_is_corrupt() {
        let set = ResultSet::from_rows(vec!["c".into()], vec![vec![Cell::Null]])
            .expect("rows");
        let mut buf = encode_frame(&set).expect("encode");
        let last = buf.len() - 1;
        buf[last] = 7;
        let err = decode_frame(&buf).expect_err("tag");
        assert!(err.message().unwrap_or_default().contains("tag 7"));
    }
}
