//! Streams an uploaded file into fixed-size batches of indexed rows.

use crate::attachments::{AttachmentError, AttachmentStore, FileRef};
use crate::decode::{self, DecodeError, DecodingReader};
use crate::i18n::FailureReason;
use crate::schema::{ENCODING_MARKER_COLUMN, FIELD_SEPARATOR, RawRow};
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{self, Read},
};
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file cannot be decoded as {encoding}")]
    WrongEncoding { encoding: &'static str },
    #[error("file structure is malformed: {0}")]
    IllegalQuoting(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("failed to parse file: {0}")]
    Csv(csv::Error),
    #[error("batch payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("work queue closed while splitting")]
    Closed,
    #[error("splitting aborted: {0}")]
    Aborted(String),
}

impl From<DecodeError> for IngestError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(err) => IngestError::Io(err),
        }
    }
}

impl IngestError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            IngestError::WrongEncoding { .. } => FailureReason::WrongEncoding,
            IngestError::IllegalQuoting(_) => FailureReason::IllegalQuoting,
            _ => FailureReason::UnknownError,
        }
    }
}

/// Quoting that the `csv` reader would otherwise accept silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteViolation {
    #[error("line {line}: stray quote inside an unquoted field")]
    Stray { line: u64 },
    #[error("line {line}: unexpected character after a closing quote")]
    AfterClosingQuote { line: u64 },
    #[error("quote opened on line {line} is never closed")]
    Unclosed { line: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum QuoteState {
    #[default]
    FieldStart,
    Unquoted,
    Quoted,
    ClosingQuote,
}

/// Tracks field quoting over decoded UTF-8 bytes.
#[derive(Debug, Default)]
struct QuoteScanner {
    state: QuoteState,
    newlines: u64,
    opened_at: u64,
}

impl QuoteScanner {
    fn feed(&mut self, bytes: &[u8]) -> Result<(), QuoteViolation> {
        for &byte in bytes {
            let line = self.newlines + 1;
            self.state = match (self.state, byte) {
                (QuoteState::Quoted, b'"') => QuoteState::ClosingQuote,
                (QuoteState::Quoted, _) => QuoteState::Quoted,
                (QuoteState::FieldStart, b'"') => {
                    self.opened_at = line;
                    QuoteState::Quoted
                }
                (QuoteState::ClosingQuote, b'"') => QuoteState::Quoted,
                (_, FIELD_SEPARATOR | b'\n' | b'\r') => QuoteState::FieldStart,
                (QuoteState::Unquoted, b'"') => return Err(QuoteViolation::Stray { line }),
                (QuoteState::ClosingQuote, _) => {
                    return Err(QuoteViolation::AfterClosingQuote { line });
                }
                (QuoteState::FieldStart | QuoteState::Unquoted, _) => QuoteState::Unquoted,
            };
            if byte == b'\n' {
                self.newlines += 1;
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), QuoteViolation> {
        match self.state {
            QuoteState::Quoted => Err(QuoteViolation::Unclosed {
                line: self.opened_at,
            }),
            _ => Ok(()),
        }
    }
}

/// Passes bytes through unchanged, failing the read on malformed quoting.
struct QuoteChecked<R> {
    inner: R,
    scanner: QuoteScanner,
}

impl<R: Read> Read for QuoteChecked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        let checked = if read == 0 {
            self.scanner.finish()
        } else {
            self.scanner.feed(&buf[..read])
        };
        checked.map_err(|violation| io::Error::new(io::ErrorKind::InvalidData, violation))?;
        Ok(read)
    }
}

enum CsvFault {
    Encoding,
    Quoting(String),
    Structure,
    Other,
}

fn classify(err: csv::Error, encoding: &'static Encoding) -> IngestError {
    let fault = match err.kind() {
        csv::ErrorKind::Utf8 { .. } => CsvFault::Encoding,
        csv::ErrorKind::Io(io) if decode::is_malformed_input(io) => CsvFault::Encoding,
        csv::ErrorKind::Io(io) => match io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<QuoteViolation>())
        {
            Some(violation) => CsvFault::Quoting(violation.to_string()),
            None => CsvFault::Other,
        },
        csv::ErrorKind::UnequalLengths { .. } => CsvFault::Structure,
        _ => CsvFault::Other,
    };
    match fault {
        CsvFault::Encoding => IngestError::WrongEncoding {
            encoding: encoding.name(),
        },
        CsvFault::Quoting(violation) => IngestError::IllegalQuoting(violation),
        CsvFault::Structure => IngestError::IllegalQuoting(err.to_string()),
        CsvFault::Other => IngestError::Csv(err),
    }
}

/// Rows keyed by their 1-based position in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    pub rows: BTreeMap<u64, RawRow>,
}

impl Batch {
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    pub encoding: &'static Encoding,
    pub rows: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitSummary {
    pub rows: u64,
    pub batches: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    batch_size: usize,
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl Splitter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn csv_reader<R: Read>(
        source: R,
        encoding: &'static Encoding,
    ) -> csv::Reader<QuoteChecked<DecodingReader<R>>> {
        csv::ReaderBuilder::new()
            .delimiter(FIELD_SEPARATOR)
            .quote(b'"')
            .has_headers(true)
            .flexible(false)
            .from_reader(QuoteChecked {
                inner: DecodingReader::new(source, encoding),
                scanner: QuoteScanner::default(),
            })
    }

    /// Detects the encoding, then decodes and parses the whole file once.
    ///
    /// Any encoding or structural fault surfaces here, before a single batch exists.
    pub fn preflight(
        &self,
        attachments: &dyn AttachmentStore,
        file: &FileRef,
    ) -> Result<Preflight, IngestError> {
        let encoding = decode::detect_encoding(attachments.open(file)?)?;
        let mut reader = Self::csv_reader(attachments.open(file)?, encoding);
        reader.headers().map_err(|err| classify(err, encoding))?;

        let mut record = csv::StringRecord::new();
        let mut rows = 0u64;
        while reader
            .read_record(&mut record)
            .map_err(|err| classify(err, encoding))?
        {
            rows += 1;
        }
        Ok(Preflight { encoding, rows })
    }

    /// Streams rows in file order, handing each full batch to `emit`.
    ///
    /// At most one batch is buffered at a time.
    pub fn split<R, F>(
        &self,
        source: R,
        encoding: &'static Encoding,
        mut emit: F,
    ) -> Result<SplitSummary, IngestError>
    where
        R: Read,
        F: FnMut(Batch) -> Result<(), IngestError>,
    {
        let mut reader = Self::csv_reader(source, encoding);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| classify(err, encoding))?
            .iter()
            .map(|header| header.trim().to_string())
            .collect();

        let mut summary = SplitSummary::default();
        let mut batch = Batch::default();
        for record in reader.records() {
            let record = record.map_err(|err| classify(err, encoding))?;
            summary.rows += 1;
            batch.rows.insert(summary.rows, raw_row(&headers, &record));
            if batch.len() >= self.batch_size {
                emit(std::mem::take(&mut batch))?;
                summary.batches += 1;
            }
        }
        if !batch.is_empty() {
            emit(batch)?;
            summary.batches += 1;
        }
        Ok(summary)
    }
}

fn raw_row(headers: &[String], record: &csv::StringRecord) -> RawRow {
    headers
        .iter()
        .zip(record.iter())
        .filter(|(header, _)| header.as_str() != ENCODING_MARKER_COLUMN)
        .map(|(header, value)| (header.clone(), value.to_string()))
        .collect()
}
