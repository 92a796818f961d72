//! Incremental CSV parsing of export responses.
//!
//! The export endpoint answers with a header record followed by one record
//! per event. [`parse_results`] pulls records off any [`Read`] as they arrive
//! and hands them to a [`RowSink`]; nothing beyond the reader's buffer is held
//! in memory.

use std::io::Read;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, warn};

/// Ordered field names of one search's result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Arc<[String]>,
}

impl Schema {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            fields: fields.into(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    /// Position of `name` in the schema.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

/// Receiver of parsed records.
pub trait RowSink {
    /// Called once, before any row, with the header record.
    fn on_schema(&mut self, schema: &Schema);

    /// Called for each record whose width matches the schema.
    /// Returning `Break` stops parsing; the row is not counted as delivered.
    fn on_row(&mut self, fields: Vec<String>) -> ControlFlow<()>;
}

impl<S: RowSink + ?Sized> RowSink for &mut S {
    fn on_schema(&mut self, schema: &Schema) {
        (**self).on_schema(schema)
    }

    fn on_row(&mut self, fields: Vec<String>) -> ControlFlow<()> {
        (**self).on_row(fields)
    }
}

/// What a parse run saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseSummary {
    /// Header width, or `None` when the response had no usable header.
    pub schema_width: Option<usize>,
    /// Rows accepted by the sink.
    pub rows: u64,
    /// Records dropped for not matching the header width.
    pub dropped: u64,
    /// The sink asked to stop before the end of input.
    pub stopped_early: bool,
    /// Read failure that ended the stream, if any.
    pub error: Option<String>,
}

/// Parse `reader` as CSV, feeding `sink`.
///
/// A missing header, or a header consisting of one empty field, means the
/// search produced no results: the sink is never called. A blank line is a
/// record with one empty field. Records whose width
/// differs from the header are skipped. A read error ends parsing; rows already
/// delivered stand and the error is logged and returned in the summary.
///
/// `reader` is consumed and dropped before this returns on every path, which
/// closes the underlying response body.
pub fn parse_results<R, S>(reader: R, mut sink: S) -> ParseSummary
where
    R: Read,
    S: RowSink,
{
    let mut summary = ParseSummary::default();
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(BlankLines::new(reader));
    let mut record = csv::ByteRecord::new();

    let header = match csv.read_byte_record(&mut record) {
        Ok(true) => decode(&record),
        Ok(false) => {
            debug!("export stream ended before a header");
            return summary;
        }
        Err(e) => {
            warn!(error = %e, "failed reading export header");
            summary.error = Some(e.to_string());
            return summary;
        }
    };

    if header.is_empty() || (header.len() == 1 && header[0].is_empty()) {
        debug!("export stream has a blank header, no results");
        return summary;
    }

    let schema = Schema::new(header);
    let width = schema.width();
    summary.schema_width = Some(width);
    sink.on_schema(&schema);

    loop {
        match csv.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) if record.len() != width => {
                summary.dropped += 1;
            }
            Ok(true) => {
                if sink.on_row(decode(&record)).is_break() {
                    summary.stopped_early = true;
                    break;
                }
                summary.rows += 1;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    rows = summary.rows,
                    "export stream failed mid-read, keeping rows delivered so far"
                );
                summary.error = Some(e.to_string());
                break;
            }
        }
    }

    if summary.dropped > 0 {
        debug!(dropped = summary.dropped, width, "skipped records with mismatched width");
    }
    summary
}

/// Rewrites blank lines outside quoted fields as `""`, so the csv reader
/// yields them as a one-empty-field record instead of skipping them.
struct BlankLines<R> {
    inner: R,
    scratch: Box<[u8]>,
    out: Vec<u8>,
    pos: usize,
    field: FieldState,
    line_start: bool,
    after_cr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldState {
    Start,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

impl<R: Read> BlankLines<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            scratch: vec![0; 8 * 1024].into_boxed_slice(),
            out: Vec::new(),
            pos: 0,
            field: FieldState::Start,
            line_start: true,
            after_cr: false,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.field == FieldState::Quoted {
            if byte == b'"' {
                self.field = FieldState::QuoteInQuoted;
            }
            self.out.push(byte);
            return;
        }

        match byte {
            b'\n' if self.after_cr => {
                self.after_cr = false;
            }
            b'\n' | b'\r' => {
                if self.line_start {
                    self.out.extend_from_slice(b"\"\"");
                }
                self.line_start = true;
                self.after_cr = byte == b'\r';
                self.field = FieldState::Start;
            }
            _ => {
                self.line_start = false;
                self.after_cr = false;
                self.field = match (self.field, byte) {
                    (_, b',') => FieldState::Start,
                    (FieldState::Start, b'"') | (FieldState::QuoteInQuoted, b'"') => FieldState::Quoted,
                    _ => FieldState::Unquoted,
                };
            }
        }
        self.out.push(byte);
    }
}

impl<R: Read> Read for BlankLines<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos == self.out.len() {
            let mut scratch = std::mem::take(&mut self.scratch);
            let read = self.inner.read(&mut scratch);
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.scratch = scratch;
                    return Err(e);
                }
            };
            self.out.clear();
            self.pos = 0;
            for &byte in &scratch[..n] {
                self.push(byte);
            }
            self.scratch = scratch;
            if n == 0 {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.out.len() - self.pos);
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn decode(record: &csv::ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}
