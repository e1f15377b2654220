use anyhow::{Context, Result};
use async_trait::async_trait;
use mpph_core::{Message, Operator, RawUserRecord, RecordTx, Source};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Reads a Mixpanel people CSV export, one [`RawUserRecord`] per data row.
///
/// The first row is the header; every data row must have the same number of
/// fields.
pub struct UsersCsvSource {
    pub id: String,
    pub path: String,
}

impl UsersCsvSource {
    pub fn new(id: String, path: String) -> Self {
        Self { id, path }
    }

    /// Number of data rows, used for the duration estimate before import.
    pub fn count_rows(&self) -> Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)
            .with_context(|| format!("open {}", self.path))?;
        let mut rows = 0usize;
        for result in reader.records() {
            result.with_context(|| format!("parse CSV {}", self.path))?;
            rows += 1;
        }
        Ok(rows)
    }
}

#[async_trait]
impl Operator for UsersCsvSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for UsersCsvSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<()> {
        let file = std::fs::File::open(&self.path).with_context(|| format!("open {}", self.path))?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

        let headers = reader
            .headers()
            .with_context(|| format!("read CSV header of {}", self.path))?
            .clone();
        info!(file = %self.path, columns = headers.len(), "Reading users CSV");

        let mut rows = 0usize;
        for result in reader.records() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let record = result.with_context(|| format!("parse CSV {}", self.path))?;
            let row: RawUserRecord = headers.iter().zip(record.iter()).collect();
            if tx.send(Message::RawUser(row)).await.is_err() {
                return Ok(());
            }
            rows += 1;
        }

        info!(rows, "Users CSV finished");
        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn rows_become_raw_users() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "$distinct_id,$email\nu1,a@x.com\nu2,\n").unwrap();
        let mut source = UsersCsvSource::new("csv".into(), file.path().to_str().unwrap().into());
        assert_eq!(source.count_rows().unwrap(), 2);

        let (tx, mut rx) = mpsc::channel(8);
        source.run(tx, CancellationToken::new()).await.unwrap();

        let mut users = vec![];
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::RawUser(row) => users.push(row),
                Message::Eos => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].get("$email"), Some("a@x.com"));
        assert_eq!(users[1].get("$distinct_id"), Some("u2"));
    }

    #[tokio::test]
    async fn ragged_row_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "a,b\n1,2\n3\n").unwrap();
        let mut source = UsersCsvSource::new("csv".into(), file.path().to_str().unwrap().into());
        let (tx, _rx) = mpsc::channel(8);
        assert!(source.run(tx, CancellationToken::new()).await.is_err());
    }
}
