//! NaPTAN reference-data loading: fetch the published zip of CSVs, pick
//! one member file, and stream its rows into the Redis pipeline as `SET`
//! commands.

use std::io::Cursor;

use tokio::sync::{mpsc, watch};

use crate::repository::pipeline::{PipelineError, RedisCommand, RedisPipeline};

#[derive(Debug, thiserror::Error)]
pub enum NaptanError {
    #[error("cannot download NaPTAN CSV from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("error response from {url} - status code {status}")]
    Status { url: String, status: u16 },
    #[error("cannot read NaPTAN zip file: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("file {0} not found in zip")]
    FileNotFound(String),
    #[error("cannot read row in file {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },
    #[error("row in file {file} has no column {column}")]
    RowShape { file: String, column: usize },
    #[error("csv channelling cancelled")]
    Cancelled,
    #[error("command channel closed early")]
    ChannelClosed,
}

/// Which member file to extract and which columns form the key/value pair.
pub struct CsvLoad {
    pub filename: String,
    pub key_column: usize,
    pub value_column: usize,
}

impl CsvLoad {
    /// `Stops.csv`: stop ATCO code to locality name.
    pub fn locality_names(filename: String) -> Self {
        CsvLoad {
            filename,
            key_column: 0,
            value_column: 18,
        }
    }

    /// `StopsInArea.csv`: stop ATCO code to parent stop-area ATCO code.
    pub fn stops_in_area(filename: String) -> Self {
        CsvLoad {
            filename,
            key_column: 1,
            value_column: 0,
        }
    }

    /// `RailReferences.csv`: CRS code to station ATCO code.
    pub fn rail_references(filename: String) -> Self {
        CsvLoad {
            filename,
            key_column: 2,
            value_column: 0,
        }
    }
}

pub struct Naptan {
    pub client: reqwest::Client,
    pub url: String,
}

impl Naptan {
    /// Fetches the zip, holding the whole body in memory. Any status of
    /// 400 or above is a hard failure.
    pub async fn download(&self) -> Result<Vec<u8>, NaptanError> {
        log::debug!("download NaPTAN data from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|source| NaptanError::Download {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(NaptanError::Status {
                url: self.url.clone(),
                status,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| NaptanError::Download {
                url: self.url.clone(),
                source,
            })?;

        Ok(body.to_vec())
    }
}

/// Opens the archive, selects the target file by case-insensitive name,
/// skips the header row and emits one `SET` per row. If the target file is
/// absent the command channel is closed immediately and an error returned.
pub async fn channel_csv_commands(
    zip_bytes: &[u8],
    load: &CsvLoad,
    send: mpsc::Sender<RedisCommand>,
    mut exit: watch::Receiver<bool>,
) -> Result<(), NaptanError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;

    let member = archive
        .file_names()
        .find(|name| name.eq_ignore_ascii_case(&load.filename))
        .map(|name| name.to_string())
        .ok_or_else(|| NaptanError::FileNotFound(load.filename.clone()))?;

    log::debug!("read file in zip: {member}");

    let file_bytes = {
        let mut file = archive.by_name(&member)?;
        let mut file_bytes = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut file_bytes)
            .map_err(zip::result::ZipError::Io)?;
        file_bytes
    };
    let mut reader = csv::Reader::from_reader(Cursor::new(file_bytes));

    for result in reader.records() {
        let record = result.map_err(|source| NaptanError::Csv {
            file: member.clone(),
            source,
        })?;

        let key = record
            .get(load.key_column)
            .ok_or_else(|| NaptanError::RowShape {
                file: member.clone(),
                column: load.key_column,
            })?;
        let value = record
            .get(load.value_column)
            .ok_or_else(|| NaptanError::RowShape {
                file: member.clone(),
                column: load.value_column,
            })?;

        let (command, _ack) = RedisCommand::set(key, value);

        tokio::select! {
            _ = exit.changed() => return Err(NaptanError::Cancelled),
            sent = send.send(command) => sent.map_err(|_| NaptanError::ChannelClosed)?,
        }
    }

    log::debug!("read file done: {member}");

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(transparent)]
    Naptan(#[from] NaptanError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("an error occurred performing a concurrent operation: see previous log output")]
    Failed,
}

/// One full load: fetch the zip, then run the CSV extraction and the Redis
/// pipeline side by side until both finish. All failures are logged and
/// collapsed into a single aggregate error.
pub async fn run_loader(
    naptan: &Naptan,
    load: CsvLoad,
    pipeline: &RedisPipeline,
) -> Result<(), LoaderError> {
    let zip_bytes = naptan.download().await?;

    let (exit_tx, exit_rx) = watch::channel(false);
    let (send, receive) = mpsc::channel(pipeline.flush_after);

    let channelled = channel_csv_commands(&zip_bytes, &load, send, exit_rx.clone());
    let piped = pipeline.run(exit_rx, receive);

    let (channel_result, pipe_result) = tokio::join!(channelled, piped);
    drop(exit_tx);

    let mut failed = false;
    if let Err(e) = channel_result {
        log::error!("{e}");
        failed = true;
    }
    if let Err(e) = pipe_result {
        log::error!("{e}");
        failed = true;
    }

    if failed {
        return Err(LoaderError::Failed);
    }
    Ok(())
}
