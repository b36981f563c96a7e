//! Append-only, self-describing CSV writer.
//!
//! The first line of a file is its sorted column header. An existing file's
//! header is read back on open and becomes authoritative: every subsequent
//! row must carry exactly the same column set, otherwise the whole write is
//! rejected and nothing is appended.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::AppError;

pub const DEFAULT_VALUE_SEPARATOR: char = ';';
pub const DEFAULT_DECIMAL_SEPARATOR: char = ',';
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub enum CsvValue {
    Time(DateTime<Utc>),
    Text(String),
    Int(i64),
    Float(f64),
}

/// One row; the map keys are the column names. A `BTreeMap` keeps the
/// column order sorted by construction.
pub type CsvRecord = BTreeMap<String, CsvValue>;

pub struct CsvWriter {
    pub value_separator: char,
    pub decimal_separator: char,
    pub date_format: String,
    header: Option<Vec<String>>,
    is_new_file: bool,
    path: PathBuf,
    file: Option<File>,
}

impl Default for CsvWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvWriter {
    pub fn new() -> Self {
        Self {
            value_separator: DEFAULT_VALUE_SEPARATOR,
            decimal_separator: DEFAULT_DECIMAL_SEPARATOR,
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            header: None,
            is_new_file: false,
            path: PathBuf::new(),
            file: None,
        }
    }

    /// Opens (appending) or creates the file. The header of an existing,
    /// non-empty file is read back, sorted and cached as authoritative.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let path = path.as_ref();
        self.path = path.to_path_buf();
        self.is_new_file = !path.is_file();

        if !self.is_new_file {
            self.header = self.read_header()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(file);
        Ok(())
    }

    /// Whether the file did not exist prior to this `open`.
    pub fn is_new_file(&self) -> bool {
        self.is_new_file
    }

    /// Writes the row's column names, sorted, as the single header line.
    /// Fails once a header is already established for this handle.
    pub fn write_header_only(&mut self, row: &CsvRecord) -> Result<(), AppError> {
        if self.header.is_some() {
            return Err(AppError::HeaderAlreadyExists);
        }

        let columns: Vec<String> = row.keys().cloned().collect();
        let line = self.join(columns.iter().map(String::as_str));
        self.append_lines(&line)?;
        debug!(path = %self.path.display(), columns = columns.len(), "csv header written");
        self.header = Some(columns);
        Ok(())
    }

    /// Appends rows. The first row establishes the header when none is
    /// cached yet; any row whose column set differs from the header fails
    /// the whole batch with nothing written.
    pub fn write(&mut self, rows: &[CsvRecord]) -> Result<(), AppError> {
        let mut out = String::new();

        for row in rows {
            let columns: Vec<String> = row.keys().cloned().collect();
            if let Some(header) = &self.header {
                if *header != columns {
                    return Err(AppError::HeaderMismatch);
                }
            } else {
                self.header = Some(columns);
            }

            let line = self.join(row.values().map(|v| self.format_value(v)).collect::<Vec<_>>());
            out.push_str(&line);
        }

        self.append_lines(&out)?;
        debug!(path = %self.path.display(), rows = rows.len(), "csv rows written");
        Ok(())
    }

    fn format_value(&self, v: &CsvValue) -> String {
        match v {
            CsvValue::Time(t) => t.format(&self.date_format).to_string(),
            CsvValue::Text(s) => s.clone(),
            CsvValue::Int(i) => i.to_string(),
            CsvValue::Float(f) => {
                let s = format!("{f:.6}");
                if self.decimal_separator == '.' {
                    s
                } else {
                    s.replace('.', &self.decimal_separator.to_string())
                }
            }
        }
    }

    fn join<I, S>(&self, fields: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut line = String::new();
        for (i, f) in fields.into_iter().enumerate() {
            if i > 0 {
                line.push(self.value_separator);
            }
            line.push_str(f.as_ref());
        }
        line.push('\n');
        line
    }

    fn append_lines(&mut self, data: &str) -> Result<(), AppError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::Io(std::io::Error::other("csv file not open")))?;
        file.write_all(data.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn read_header(&self) -> Result<Option<Vec<String>>, AppError> {
        let mut first_line = String::new();
        let mut reader = BufReader::new(File::open(&self.path)?);
        if reader.read_line(&mut first_line)? == 0 {
            return Ok(None);
        }

        let mut columns: Vec<String> = first_line
            .trim_end_matches(['\r', '\n'])
            .split(self.value_separator)
            .map(str::to_string)
            .collect();
        columns.sort();
        Ok(Some(columns))
    }
}

/// Renders a period-templated file name, e.g. `energy_%Y%m.csv`.
pub fn file_name(pattern: &str, t: DateTime<Utc>) -> String {
    t.format(pattern).to_string()
}
