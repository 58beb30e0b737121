//! Raw record sources
//!
//! A source yields a [`RawBatch`]: the header row plus string cells, with empty
//! cells already turned into `None`. Typing happens later, in validation.

use crate::error::{EtlError, Result};
use crate::model::{Column, OperationRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Untyped rows as produced by an extractor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatch {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RawBatch {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Append a row; empty or whitespace-only cells become `None`
    pub fn push_row<I, S>(&mut self, cells: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let row = cells
            .into_iter()
            .map(|cell| {
                let cell = cell.as_ref().trim();
                (!cell.is_empty()).then(|| cell.to_string())
            })
            .collect();
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Header-ordered view of records, e.g. to feed already-typed data back in
    pub fn from_records(records: &[OperationRecord]) -> Self {
        let mut batch = Self::new(Column::ALL.iter().map(|c| c.name().to_string()).collect());
        for record in records {
            batch.push_row(Column::ALL.iter().map(|c| record.value(*c).to_string()));
        }
        batch
    }
}

/// Something that can produce a raw batch for one pipeline run
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Human-readable origin, recorded as `input_source` in run metrics
    fn describe(&self) -> String;

    async fn extract(&self) -> Result<RawBatch>;
}

#[async_trait]
impl RecordSource for RawBatch {
    fn describe(&self) -> String {
        format!("memory:{} rows", self.len())
    }

    async fn extract(&self) -> Result<RawBatch> {
        Ok(self.clone())
    }
}

/// CSV file with a header row
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSource for CsvSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn extract(&self) -> Result<RawBatch> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            EtlError::extraction(format!("failed to read '{}': {e}", self.path.display()))
        })?;

        let batch = parse_csv(&bytes)?;
        info!(
            path = %self.path.display(),
            rows = batch.len(),
            columns = batch.headers.len(),
            "extracted_csv"
        );
        Ok(batch)
    }
}

/// Parse CSV bytes into a raw batch. Short rows are padded with `None`.
pub fn parse_csv(bytes: &[u8]) -> Result<RawBatch> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    let width = headers.len();
    let mut batch = RawBatch::new(headers);

    for result in reader.records() {
        let record = result?;
        batch.push_row((0..width).map(|i| record.get(i).unwrap_or("")));
    }

    debug!(rows = batch.len(), "parsed_csv");
    Ok(batch)
}

/// Write records as CSV with the canonical header
pub fn write_records_csv(path: &Path, records: &[OperationRecord]) -> Result<()> {
    let io_err = |e: std::io::Error| {
        EtlError::extraction(format!("failed to write '{}': {e}", path.display()))
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(Column::ALL.iter().map(|c| c.name()))?;
    for record in records {
        writer.write_record(Column::ALL.iter().map(|c| record.value(*c).to_string()))?;
    }
    writer.flush().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::test_support::record;
    use std::io::Write;

    const SAMPLE: &str = "\
fecha_operacion,numero_operacion,tipo_operacion,monto,moneda,cuenta_origen,cuenta_destino,banco_origen,banco_destino,descripcion,estado,canal
2025-01-10 09:30:00,OP-00000001,DEPOSITO,150.00,PEN,191-1234567-0-12,,BCP,,Deposito en ventanilla,COMPLETADA,SUCURSAL
2025-01-10 10:00:00,OP-00000002,TRANSFERENCIA,75.5,USD,191-1234567-0-12,193-7654321-1-45,BCP,BBVA,,PENDIENTE,WEB
";

    #[test]
    fn test_parse_csv_empty_cells_are_none() {
        let batch = parse_csv(SAMPLE.as_bytes()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.headers.len(), 12);

        let dest = batch.column_index("cuenta_destino").unwrap();
        assert_eq!(batch.rows[0][dest], None);
        assert_eq!(batch.rows[1][dest].as_deref(), Some("193-7654321-1-45"));

        let desc = batch.column_index("descripcion").unwrap();
        assert_eq!(batch.rows[1][desc], None);
    }

    #[test]
    fn test_parse_csv_pads_short_rows() {
        let batch = parse_csv(b"a,b,c\n1,2\n").unwrap();
        assert_eq!(batch.rows[0], vec![Some("1".into()), Some("2".into()), None]);
    }

    #[tokio::test]
    async fn test_csv_source_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let source = CsvSource::new(file.path());
        let batch = source.extract().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(source.describe(), file.path().display().to_string());
    }

    #[tokio::test]
    async fn test_csv_source_missing_file() {
        let source = CsvSource::new("/nonexistent/operaciones.csv");
        let err = source.extract().await.unwrap_err();
        assert!(matches!(err, EtlError::Extraction(_)));
    }

    #[test]
    fn test_write_then_parse_keeps_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/deduped.csv");
        write_records_csv(&path, &[record(1, "10.00"), record(2, "20.00")]).unwrap();

        let batch = parse_csv(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.headers[0], "fecha_operacion");
        assert_eq!(batch.headers[12], "content_hash");
    }
}
