//! Row sources and sinks.
//!
//! CSV files are read and written on tokio's blocking pool; the async side
//! only ever awaits the result of one record.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchIoError {
    #[error("cannot open input {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot create output {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("file I/O task failed: {0}")]
    Blocking(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRead {
    Row(Vec<String>),
    /// The record exists but cannot be decoded; the source has moved past it.
    Malformed(String),
    End,
}

#[async_trait]
pub trait RowSource: Send {
    /// Number of records, when known up front.
    fn total_rows(&self) -> Option<usize> {
        None
    }

    async fn next_row(&mut self) -> Result<RowRead, BatchIoError>;
}

#[async_trait]
pub trait RowSink: Send {
    async fn write_row(&mut self, row: &[String]) -> Result<(), BatchIoError>;

    async fn finish(&mut self) -> Result<(), BatchIoError> {
        Ok(())
    }
}

/// Run `op` against the value in `slot` on the blocking pool and put the value
/// back afterwards. A slot left empty by a failed task stays unusable.
async fn blocking<T, R, F>(slot: &mut Option<T>, op: F) -> Result<R, BatchIoError>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> Result<R, BatchIoError> + Send + 'static,
{
    let mut value = slot
        .take()
        .ok_or_else(|| BatchIoError::Blocking("file handle lost after an earlier failure".into()))?;

    let (value, result) = tokio::task::spawn_blocking(move || {
        let result = op(&mut value);
        (value, result)
    })
    .await
    .map_err(|e| BatchIoError::Blocking(e.to_string()))?;

    *slot = Some(value);
    result
}

async fn spawn_io<R, F>(op: F) -> Result<R, BatchIoError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, BatchIoError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| BatchIoError::Blocking(e.to_string()))?
}

struct CsvReader {
    reader: csv::Reader<File>,
    record: csv::StringRecord,
}

impl CsvReader {
    fn next_row(&mut self) -> Result<RowRead, BatchIoError> {
        match self.reader.read_record(&mut self.record) {
            Ok(true) => Ok(RowRead::Row(self.record.iter().map(str::to_string).collect())),
            Ok(false) => Ok(RowRead::End),
            Err(error) if matches!(error.kind(), csv::ErrorKind::Io(_)) => {
                Err(BatchIoError::Read(error.to_string()))
            }
            Err(error) => Ok(RowRead::Malformed(error.to_string())),
        }
    }
}

/// Reads records from a CSV file. Record lengths may vary.
pub struct CsvRowSource {
    reader: Option<CsvReader>,
    total: usize,
}

impl CsvRowSource {
    /// Opens `path` and counts its records before the first read.
    pub async fn open(path: &Path) -> Result<Self, BatchIoError> {
        let path = path.to_path_buf();
        spawn_io(move || Self::open_blocking(&path)).await
    }

    fn open_blocking(path: &Path) -> Result<Self, BatchIoError> {
        let open = || {
            File::open(path).map_err(|source| BatchIoError::Open {
                path: path.to_path_buf(),
                source,
            })
        };

        let total = builder()
            .from_reader(open()?)
            .byte_records()
            .map_while(Result::ok)
            .count();

        Ok(Self {
            reader: Some(CsvReader {
                reader: builder().from_reader(open()?),
                record: csv::StringRecord::new(),
            }),
            total,
        })
    }
}

fn builder() -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder.has_headers(false).flexible(true);
    builder
}

#[async_trait]
impl RowSource for CsvRowSource {
    fn total_rows(&self) -> Option<usize> {
        Some(self.total)
    }

    async fn next_row(&mut self) -> Result<RowRead, BatchIoError> {
        blocking(&mut self.reader, CsvReader::next_row).await
    }
}

/// Writes each row to a CSV file and flushes it immediately.
pub struct CsvRowSink {
    writer: Option<csv::Writer<File>>,
}

impl CsvRowSink {
    pub async fn create(path: &Path) -> Result<Self, BatchIoError> {
        let path = path.to_path_buf();
        spawn_io(move || {
            let file = File::create(&path).map_err(|source| BatchIoError::Create {
                path: path.clone(),
                source,
            })?;
            let writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
            Ok(Self {
                writer: Some(writer),
            })
        })
        .await
    }
}

fn flush(writer: &mut csv::Writer<File>) -> Result<(), BatchIoError> {
    writer
        .flush()
        .map_err(|e| BatchIoError::Write(e.to_string()))
}

#[async_trait]
impl RowSink for CsvRowSink {
    async fn write_row(&mut self, row: &[String]) -> Result<(), BatchIoError> {
        let row = row.to_vec();
        blocking(&mut self.writer, move |writer| {
            writer
                .write_record(&row)
                .map_err(|e| BatchIoError::Write(e.to_string()))?;
            flush(writer)
        })
        .await
    }

    async fn finish(&mut self) -> Result<(), BatchIoError> {
        blocking(&mut self.writer, flush).await
    }
}

/// In-memory source. `Err` entries stand for undecodable records.
#[derive(Debug, Default)]
pub struct VecRowSource {
    rows: VecDeque<Result<Vec<String>, String>>,
    total: usize,
}

impl VecRowSource {
    pub fn new<I, R, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_records(
            rows.into_iter()
                .map(|row| Ok(row.into_iter().map(Into::into).collect())),
        )
    }

    pub fn from_records(records: impl IntoIterator<Item = Result<Vec<String>, String>>) -> Self {
        let rows: VecDeque<_> = records.into_iter().collect();
        Self {
            total: rows.len(),
            rows,
        }
    }
}

#[async_trait]
impl RowSource for VecRowSource {
    fn total_rows(&self) -> Option<usize> {
        Some(self.total)
    }

    async fn next_row(&mut self) -> Result<RowRead, BatchIoError> {
        Ok(match self.rows.pop_front() {
            Some(Ok(row)) => RowRead::Row(row),
            Some(Err(message)) => RowRead::Malformed(message),
            None => RowRead::End,
        })
    }
}

/// In-memory sink, optionally failing once it holds `capacity` rows.
#[derive(Debug, Default)]
pub struct VecRowSink {
    pub rows: Vec<Vec<String>>,
    capacity: Option<usize>,
}

impl VecRowSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_after(capacity: usize) -> Self {
        Self {
            rows: Vec::new(),
            capacity: Some(capacity),
        }
    }
}

#[async_trait]
impl RowSink for VecRowSink {
    async fn write_row(&mut self, row: &[String]) -> Result<(), BatchIoError> {
        if self.capacity.is_some_and(|cap| self.rows.len() >= cap) {
            return Err(BatchIoError::Write("sink is full".to_string()));
        }
        self.rows.push(row.to_vec());
        Ok(())
    }
}
