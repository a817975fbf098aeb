use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, SaylError};

/// Cycles through the rows of a CSV file, handing one row per call.
///
/// The whole file is read at construction. Row access is wait-free: an atomic
/// counter is post-incremented and taken modulo the row count, so every worker
/// observes monotonically increasing row indices and the data cycles
/// indefinitely.
#[derive(Debug)]
pub struct CsvFeeder {
    index: AtomicUsize,
    rows: Vec<HashMap<String, String>>,
}

impl CsvFeeder {
    /// Read a CSV file. The first row must be a header with no empty names
    /// and at least one data row must follow. Ragged rows simply leave the
    /// missing columns absent.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| SaylError::Feeder(format!("failed to open {}: {e}", path.display())))?;

        let headers = reader
            .headers()
            .map_err(|e| SaylError::Feeder(format!("failed to read csv header: {e}")))?
            .clone();
        if headers.is_empty() {
            return Err(SaylError::Feeder(
                "csv file must have a header row".to_string(),
            ));
        }
        for header in headers.iter() {
            if header.is_empty() {
                return Err(SaylError::Feeder(
                    "csv header contains an empty field".to_string(),
                ));
            }
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| SaylError::Feeder(format!("failed to read csv row: {e}")))?;
            let mut row = HashMap::with_capacity(headers.len());
            for (i, value) in record.iter().enumerate() {
                if let Some(name) = headers.get(i) {
                    row.insert(name.to_string(), value.to_string());
                }
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(SaylError::Feeder(
                "csv file must have a header and at least one data row".to_string(),
            ));
        }

        Ok(Self {
            index: AtomicUsize::new(0),
            rows,
        })
    }

    /// Next row in round-robin order, looping back to the start.
    pub fn next_row(&self) -> &HashMap<String, String> {
        let i = self.index.fetch_add(1, Ordering::Relaxed);
        &self.rows[i % self.rows.len()]
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn cycles_through_rows() {
        let file = write_csv("user,pass\na,1\nb,2\nc,3\n");
        let feeder = CsvFeeder::new(file.path()).unwrap();
        assert_eq!(feeder.row_count(), 3);

        // After k * row_count calls every row has been seen exactly k times.
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let row = feeder.next_row();
            *counts.entry(row["user"].clone()).or_default() += 1;
        }
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 3);
        assert_eq!(counts["c"], 3);
    }

    #[test]
    fn rejects_header_only() {
        let file = write_csv("user,pass\n");
        assert!(CsvFeeder::new(file.path()).is_err());
    }

    #[test]
    fn rejects_empty_header_name() {
        let file = write_csv("user,,pass\na,b,c\n");
        assert!(CsvFeeder::new(file.path()).is_err());
    }

    #[test]
    fn ragged_rows_leave_columns_absent() {
        let file = write_csv("user,pass,role\nalice,secret\n");
        let feeder = CsvFeeder::new(file.path()).unwrap();
        let row = feeder.next_row();
        assert_eq!(row["user"], "alice");
        assert_eq!(row["pass"], "secret");
        assert!(!row.contains_key("role"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(CsvFeeder::new("/definitely/not/here.csv").is_err());
    }
}
