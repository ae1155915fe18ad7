//! Walks a TransXChange bundle, finds services whose description matches a
//! configured search term, and emits `(operator+line) → description`
//! entries for the circular-services cache.

use std::io::Read;
use std::sync::Mutex;

use chrono::NaiveDate;
use regex::Regex;
use tokio::sync::{mpsc, watch};

use departures_service::repository::pipeline::RedisCommand;
use departures_service::transxchange::TransXChange;

#[derive(Debug, thiserror::Error)]
pub enum CircularServicesError {
    #[error("cannot read TransXChange zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("cannot read zipped file {name}: {source}")]
    ReadFile {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot unmarshal XML from file {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: quick_xml::DeError,
    },
    #[error("cannot parse {field} `{value}` in file {name}")]
    BadDate {
        field: &'static str,
        value: String,
        name: String,
    },
    #[error("cancelled processing file {0}")]
    Cancelled(String),
    #[error("command channel closed processing file {0}")]
    ChannelClosed(String),
}

/// Totals reported at the end of a run; shared by the per-file workers.
#[derive(Default)]
pub struct Counters {
    files_skipped: Mutex<usize>,
    records_added: Mutex<usize>,
}

impl Counters {
    pub fn files_skipped(&self) -> usize {
        *self.files_skipped.lock().expect("counter lock")
    }

    pub fn records_added(&self) -> usize {
        *self.records_added.lock().expect("counter lock")
    }

    fn skip_file(&self) {
        *self.files_skipped.lock().expect("counter lock") += 1;
    }

    fn add_record(&self) {
        *self.records_added.lock().expect("counter lock") += 1;
    }
}

/// Processes every file in the bundle in parallel over a shared command
/// channel. Failures are collected per file; the rest of the bundle still
/// processes.
pub async fn process_transxchange_files(
    zip_bytes: &[u8],
    search_terms: &[String],
    today: NaiveDate,
    send: mpsc::Sender<RedisCommand>,
    exit: watch::Receiver<bool>,
    counters: &Counters,
) -> Vec<CircularServicesError> {
    let files = match read_zip_entries(zip_bytes) {
        Ok(files) => files,
        Err(e) => return vec![e],
    };

    log::info!("number of TransXChange files in zip: {}", files.len());

    let results = futures::future::join_all(files.into_iter().map(|(name, content)| {
        let send = send.clone();
        let exit = exit.clone();
        async move {
            process_transxchange_file(&name, &content, search_terms, today, send, exit, counters)
                .await
        }
    }))
    .await;

    results.into_iter().filter_map(Result::err).collect()
}

fn read_zip_entries(zip_bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, CircularServicesError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(zip_bytes))?;

    let mut files = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)
            .map_err(|source| CircularServicesError::ReadFile {
                name: name.clone(),
                source,
            })?;
        files.push((name, content));
    }

    Ok(files)
}

async fn process_transxchange_file(
    name: &str,
    content: &[u8],
    search_terms: &[String],
    today: NaiveDate,
    send: mpsc::Sender<RedisCommand>,
    mut exit: watch::Receiver<bool>,
    counters: &Counters,
) -> Result<(), CircularServicesError> {
    log::debug!("processing TransXChange file {name}");

    if content.is_empty() {
        log::debug!("skipping empty file {name}");
        counters.skip_file();
        return Ok(());
    }

    let text = String::from_utf8_lossy(content);
    let txc: TransXChange =
        quick_xml::de::from_str(&text).map_err(|source| CircularServicesError::Parse {
            name: name.to_string(),
            source,
        })?;

    for service in &txc.services.service {
        let start_date = NaiveDate::parse_from_str(&service.operating_period.start_date, "%Y-%m-%d")
            .map_err(|_| CircularServicesError::BadDate {
                field: "start date",
                value: service.operating_period.start_date.clone(),
                name: name.to_string(),
            })?;

        if start_date > today {
            log::debug!(
                "skipping file {name}: start date is in the future ({})",
                service.operating_period.start_date
            );
            continue;
        }

        // No end date means the service is valid indefinitely.
        if !service.operating_period.end_date.is_empty() {
            let end_date = NaiveDate::parse_from_str(&service.operating_period.end_date, "%Y-%m-%d")
                .map_err(|_| CircularServicesError::BadDate {
                    field: "end date",
                    value: service.operating_period.end_date.clone(),
                    name: name.to_string(),
                })?;

            if end_date < today {
                log::debug!(
                    "skipping file {name}: end date is in the past ({})",
                    service.operating_period.end_date
                );
                continue;
            }
        }

        let description = service.description.trim_end_matches(' ');

        for term in search_terms {
            let re = match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))) {
                Ok(re) => re,
                Err(e) => {
                    log::warn!("cannot compile search term regex for `{term}`: {e}");
                    continue;
                }
            };

            if !re.is_match(description) {
                continue;
            }

            log::debug!(
                "search term `{term}` found in service description `{description}` in file {name}"
            );

            // Normalise the matched token to the canonical term spelling.
            let formatted = re
                .replace_all(description, regex::NoExpand(term.as_str()))
                .into_owned();

            if service.lines.line.is_empty() {
                log::info!("no line information found in file {name}");
            }

            for line in &service.lines.line {
                let mut actions = 0usize;

                for operator in &txc.operators.licensed_operator {
                    log::debug!(
                        "{} ({formatted}) operator type is LicensedOperator in file {name}",
                        line.line_name
                    );
                    send_command(
                        &send,
                        &mut exit,
                        name,
                        &operator.operator_code,
                        &line.line_name,
                        &formatted,
                        counters,
                    )
                    .await?;
                    actions += 1;
                }

                for operator in &txc.operators.operator {
                    log::debug!(
                        "{} ({formatted}) operator type is Operator in file {name}",
                        line.line_name
                    );
                    send_command(
                        &send,
                        &mut exit,
                        name,
                        &operator.operator_code,
                        &line.line_name,
                        &formatted,
                        counters,
                    )
                    .await?;
                    actions += 1;
                }

                if actions == 0 {
                    log::info!(
                        "no operator information found for line {} in file {name}",
                        line.line_name
                    );
                }
            }

            // First matching term wins; the file is done.
            return Ok(());
        }
    }

    counters.skip_file();
    Ok(())
}

async fn send_command(
    send: &mpsc::Sender<RedisCommand>,
    exit: &mut watch::Receiver<bool>,
    name: &str,
    operator_code: &str,
    line_name: &str,
    description: &str,
    counters: &Counters,
) -> Result<(), CircularServicesError> {
    let key = format!("{operator_code}{line_name}");
    log::debug!("adding command - {key}: {description}");

    counters.add_record();

    let (command, _ack) = RedisCommand::set(&key, description);

    tokio::select! {
        _ = exit.changed() => Err(CircularServicesError::Cancelled(name.to_string())),
        sent = send.send(command) => {
            sent.map_err(|_| CircularServicesError::ChannelClosed(name.to_string()))
        }
    }
}
