//! TransXChange bundles: the minimal document shape the circular-services
//! loader needs, and selection of the most recent bundle from object
//! storage.

use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum TransXChangeError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("no TransXChange zip objects found")]
    NoZipObjects,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransXChange {
    #[serde(rename = "Operators", default)]
    pub operators: Operators,
    #[serde(rename = "Services", default)]
    pub services: Services,
}

#[derive(Debug, Default, Deserialize)]
pub struct Operators {
    #[serde(rename = "LicensedOperator", default)]
    pub licensed_operator: Vec<Operator>,
    #[serde(rename = "Operator", default)]
    pub operator: Vec<Operator>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Operator {
    #[serde(rename = "OperatorCode", default)]
    pub operator_code: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Services {
    #[serde(rename = "Service", default)]
    pub service: Vec<Service>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Service {
    #[serde(rename = "Lines", default)]
    pub lines: Lines,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "OperatingPeriod", default)]
    pub operating_period: OperatingPeriod,
}

#[derive(Debug, Default, Deserialize)]
pub struct Lines {
    #[serde(rename = "Line", default)]
    pub line: Vec<Line>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Line {
    #[serde(rename = "LineName", default)]
    pub line_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OperatingPeriod {
    #[serde(rename = "StartDate", default)]
    pub start_date: String,
    #[serde(rename = "EndDate", default)]
    pub end_date: String,
}

/// Lists every object under `prefix`, keeps those whose key ends in
/// `.zip`, and fetches the most recently modified one fully into memory.
pub async fn download_latest_zip(
    store: &dyn ObjectStore,
    prefix: Option<&Path>,
) -> Result<Vec<u8>, TransXChangeError> {
    let entries: Vec<object_store::ObjectMeta> = store.list(prefix).try_collect().await?;

    let mut zips: Vec<_> = entries
        .into_iter()
        .filter(|meta| meta.location.as_ref().ends_with(".zip"))
        .collect();

    if zips.is_empty() {
        return Err(TransXChangeError::NoZipObjects);
    }

    zips.sort_by_key(|meta| meta.last_modified);
    let latest = &zips[zips.len() - 1];

    log::debug!("fetching TransXChange bundle {}", latest.location);

    let body = store.get(&latest.location).await?.bytes().await?;
    Ok(body.to_vec())
}
