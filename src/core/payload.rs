//! Purpose: Turn one `ResultSet` into a transportable payload and back.
//! Exports: `PayloadFormat`, `Payload`, `encode`, `decode`.
//! Role: Encoder stage of the relay; also backs `rowrelay decode`.
//! Invariants: decode(encode(set)) == set for every well-formed set, in every format.
//! Invariants: Payloads are self-describing; `decode` needs no format hint.
//! Invariants: Encoding never truncates; oversized or ragged input is an error.

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{MAX_PAYLOAD_BYTES, decode_frame, encode_frame, is_frame};
use crate::core::row::{Cell, ResultSet};

const JSON_FORMAT_TAG: &str = "rowrelay";
const JSON_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Frame,
    Json,
}

impl PayloadFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            PayloadFormat::Frame => "application/vnd.rowrelay.frame",
            PayloadFormat::Json => "application/json",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadFormat::Frame => "frame",
            PayloadFormat::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    format: PayloadFormat,
    bytes: Vec<u8>,
}

impl Payload {
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Serialize, Deserialize)]
struct JsonPayload {
    format: String,
    version: u32,
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

pub fn encode(set: &ResultSet, format: PayloadFormat) -> Result<Payload, Error> {
    let bytes = match format {
        PayloadFormat::Frame => encode_frame(set)?,
        PayloadFormat::Json => encode_json(set)?,
    };
    Ok(Payload { format, bytes })
}

pub fn decode(bytes: &[u8]) -> Result<ResultSet, Error> {
    if is_frame(bytes) {
        return decode_frame(bytes);
    }
    let first = bytes.iter().find(|byte| !byte.is_ascii_whitespace());
    match first {
        Some(b'{') => decode_json(bytes),
        Some(_) => Err(Error::new(ErrorKind::Corrupt)
            .with_message("unrecognized payload format")
            .with_hint("Payloads start with the RRW1 frame magic or a JSON object.")),
        None => Err(Error::new(ErrorKind::Corrupt).with_message("payload is empty")),
    }
}

fn encode_json(set: &ResultSet) -> Result<Vec<u8>, Error> {
    if let Some(row) = set.first_ragged_row() {
        return Err(Error::new(ErrorKind::Encoding).with_message(format!(
            "row {row} width differs from the {} result columns",
            set.column_count()
        )));
    }
    let doc = JsonPayload {
        format: JSON_FORMAT_TAG.to_string(),
        version: JSON_VERSION,
        columns: set.columns().to_vec(),
        rows: set
            .rows()
            .iter()
            .map(|row| row.iter().map(|cell| cell.as_str().map(str::to_string)).collect())
            .collect(),
    };
    let bytes = serde_json::to_vec(&doc).map_err(|err| {
        Error::new(ErrorKind::Encoding)
            .with_message("failed to encode json payload")
            .with_source(err)
    })?;
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(Error::new(ErrorKind::Encoding)
            .with_message(format!("payload exceeds {MAX_PAYLOAD_BYTES} bytes"))
            .with_hint("Narrow the query (fewer rows or columns) or split it into several runs."));
    }
    Ok(bytes)
}

fn decode_json(bytes: &[u8]) -> Result<ResultSet, Error> {
    let doc: JsonPayload = serde_json::from_slice(bytes).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("invalid json payload")
            .with_source(err)
    })?;
    if doc.format != JSON_FORMAT_TAG {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("unexpected payload format tag {:?}", doc.format)));
    }
    if doc.version != JSON_VERSION {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("unsupported json payload version {}", doc.version)));
    }
    let rows = doc
        .rows
        .into_iter()
        .map(|row| row.into_iter().map(Cell::from).collect())
        .collect();
    ResultSet::from_rows(doc.columns, rows).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("json rows disagree with column count")
            .with_source(err)
    })
}
