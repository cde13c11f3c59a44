//! Export file reader
//!
//! An export file starts with a three line header followed by `;` separated
//! data lines. Field 4 of each data line is the transaction type code, which
//! selects the table and schema the line is decoded against.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::decode::{decode, DecodedRecord, FieldDiagnostic};
use crate::dispatch::Dispatcher;
use crate::error::DecodeError;

/// First header line of a file that has already been processed
pub const PROCESSED_SENTINEL: &str = "#";

/// Separator between fields of a data line
pub const FIELD_DELIMITER: char = ';';

/// 1-indexed position of the transaction type code
pub const TYPE_CODE_FIELD: usize = 4;

const HEADER_LINES: usize = 3;

/// Parsed three line header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub processed: bool,
    pub source_database_id: String,
    pub report_number: String,
}

impl FileHeader {
    fn from_lines(lines: &[String]) -> Result<Self, DecodeError> {
        match lines {
            [flag, database, report] => Ok(Self {
                processed: flag.trim() == PROCESSED_SENTINEL,
                source_database_id: database.trim().to_string(),
                report_number: report.trim().to_string(),
            }),
            _ => Err(DecodeError::TruncatedHeader { found: lines.len() }),
        }
    }
}

/// Coerced fields of one data line
#[derive(Debug, Clone, Serialize)]
pub struct LineDiagnostic {
    pub line: usize,
    pub table: &'static str,
    pub fields: Vec<FieldDiagnostic>,
}

/// A decoded export file, records grouped by table
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub header: FileHeader,
    pub tables: BTreeMap<&'static str, Vec<DecodedRecord>>,
    pub diagnostics: Vec<LineDiagnostic>,
    /// Non-blank data lines read
    pub line_count: usize,
}

impl ParsedFile {
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn coerced_field_count(&self) -> usize {
        self.diagnostics.iter().map(|d| d.fields.len()).sum()
    }
}

/// Reads export files and decodes their data lines
#[derive(Debug, Clone)]
pub struct ExportReader {
    dispatcher: Arc<Dispatcher>,
}

impl ExportReader {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn parse_path(&self, path: &Path, source_tag: &str) -> Result<ParsedFile, DecodeError> {
        let file = std::fs::File::open(path)?;
        self.parse_reader(BufReader::new(file), source_tag)
    }

    pub fn parse_bytes(&self, bytes: &[u8], source_tag: &str) -> Result<ParsedFile, DecodeError> {
        self.parse_reader(bytes, source_tag)
    }

    /// Parse a whole export.
    ///
    /// A processed header returns immediately without reading the body. Any
    /// structural error in the body rejects the file.
    pub fn parse_reader<R: BufRead>(
        &self,
        mut reader: R,
        source_tag: &str,
    ) -> Result<ParsedFile, DecodeError> {
        let mut buf = Vec::new();
        let mut line_no = 0usize;

        let mut header_lines = Vec::with_capacity(HEADER_LINES);
        while header_lines.len() < HEADER_LINES {
            match next_line(&mut reader, &mut buf)? {
                Some(line) => {
                    line_no += 1;
                    header_lines.push(line);
                },
                None => break,
            }
        }
        let header = FileHeader::from_lines(&header_lines)?;

        let mut parsed = ParsedFile {
            header,
            tables: BTreeMap::new(),
            diagnostics: Vec::new(),
            line_count: 0,
        };

        if parsed.header.processed {
            debug!(source = %source_tag, "Header marks file as already processed");
            return Ok(parsed);
        }

        while let Some(line) = next_line(&mut reader, &mut buf)? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            parsed.line_count += 1;
            self.decode_line(&mut parsed, &line, line_no, source_tag)
                .map_err(|e| e.at_line(line_no))?;
        }

        Ok(parsed)
    }

    fn decode_line(
        &self,
        parsed: &mut ParsedFile,
        line: &str,
        line_no: usize,
        source_tag: &str,
    ) -> Result<(), DecodeError> {
        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        let code = type_code(&fields, line_no)?;
        let route = self.dispatcher.resolve(code)?;

        let decoded = decode(route.schema, &fields, source_tag);
        if !decoded.diagnostics.is_empty() {
            debug!(
                line = line_no,
                table = route.table,
                coerced = decoded.diagnostics.len(),
                "Coerced unparsable fields to zero"
            );
            parsed.diagnostics.push(LineDiagnostic {
                line: line_no,
                table: route.table,
                fields: decoded.diagnostics,
            });
        }

        parsed
            .tables
            .entry(route.table)
            .or_default()
            .push(decoded.record);
        Ok(())
    }
}

fn type_code(fields: &[&str], line: usize) -> Result<i64, DecodeError> {
    let raw = fields
        .get(TYPE_CODE_FIELD - 1)
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .ok_or(DecodeError::MissingTypeCode { line })?;

    raw.parse::<i64>().map_err(|_| DecodeError::InvalidTypeCode {
        line,
        value: raw.to_string(),
    })
}

/// Next line without its terminator, decoded lossily
fn next_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>, DecodeError> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
