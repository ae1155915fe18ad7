//! Client for the upstream bus SIRI endpoint (OPTIS) and the
//! StopMonitoring response shapes the poller consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum OptisError {
    #[error("cannot make OPTIS HTTP request: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("OPTIS is unavailable (status {0})")]
    Unavailable(u16),
    #[error("bad request to OPTIS (status {status}): {body}")]
    BadRequest { status: u16, body: String },
    #[error("cannot read OPTIS SIRI response: {0}")]
    Read(#[source] reqwest::Error),
    #[error("cannot unmarshal SIRI response: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("error returned from OPTIS: {0}")]
    Upstream(String),
}

impl OptisError {
    /// The HTTP status the failure maps to when surfaced to a caller.
    pub fn status_hint(&self) -> u16 {
        match self {
            OptisError::Unreachable(_) => 504,
            OptisError::Unavailable(_) => 502,
            OptisError::BadRequest { status, .. } => *status,
            OptisError::Read(_) | OptisError::Parse(_) => 500,
            OptisError::Upstream(_) => 400,
        }
    }
}

#[async_trait]
pub trait StopMonitoringApi: Send + Sync {
    async fn request(&self, siri_request: &str) -> Result<Siri, OptisError>;
}

pub struct OptisClient {
    pub client: reqwest::Client,
    pub url: String,
    pub api_key: String,
}

#[async_trait]
impl StopMonitoringApi for OptisClient {
    async fn request(&self, siri_request: &str) -> Result<Siri, OptisError> {
        log::debug!("OPTIS request to {}", self.url);

        let response = self
            .client
            .post(&self.url)
            .query(&[("apiKey", self.api_key.as_str())])
            .header("Content-Type", "text/xml")
            .body(siri_request.to_string())
            .send()
            .await
            .map_err(OptisError::Unreachable)?;

        let status = response.status().as_u16();
        if status >= 500 {
            return Err(OptisError::Unavailable(status));
        }

        let body = response.text().await.map_err(OptisError::Read)?;
        if status >= 400 {
            return Err(OptisError::BadRequest { status, body });
        }

        let siri: Siri = quick_xml::de::from_str(&body)?;
        check_response(&siri)?;
        Ok(siri)
    }
}

fn check_response(siri: &Siri) -> Result<(), OptisError> {
    let Some(delivery) = &siri.service_delivery else {
        return Err(OptisError::Upstream(
            "response carries no service delivery".to_string(),
        ));
    };

    if let Some(condition) = &delivery.error_condition {
        if let Some(description) = &condition.description {
            if !description.is_empty() {
                return Err(OptisError::Upstream(description.clone()));
            }
        }
    }

    if delivery.status != Some(true) {
        return Err(OptisError::Upstream(
            "request failed with status == false".to_string(),
        ));
    }

    Ok(())
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Siri {
    #[serde(rename = "ServiceDelivery")]
    pub service_delivery: Option<ServiceDelivery>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceDelivery {
    pub response_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub producer_ref: String,
    pub status: Option<bool>,
    pub more_data: Option<bool>,
    pub stop_monitoring_delivery: Option<StopMonitoringDelivery>,
    pub error_condition: Option<ErrorCondition>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorCondition {
    pub description: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopMonitoringDelivery {
    pub status: Option<bool>,
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub monitored_stop_visit: Vec<MonitoredStopVisit>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitoredStopVisit {
    pub recorded_at_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub monitoring_ref: String,
    #[serde(default)]
    pub monitored_vehicle_journey: MonitoredVehicleJourney,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitoredVehicleJourney {
    #[serde(default)]
    pub line_ref: String,
    #[serde(default)]
    pub direction_ref: String,
    #[serde(default)]
    pub framed_vehicle_journey_ref: FramedVehicleJourneyRef,
    #[serde(default)]
    pub operator_ref: String,
    #[serde(default)]
    pub origin_ref: String,
    #[serde(default)]
    pub origin_name: String,
    #[serde(default)]
    pub destination_ref: String,
    #[serde(default)]
    pub destination_name: String,
    pub origin_aimed_departure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub monitored_call: MonitoredCall,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FramedVehicleJourneyRef {
    #[serde(default)]
    pub data_frame_ref: String,
    #[serde(default)]
    pub dated_vehicle_journey_ref: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitoredCall {
    #[serde(default)]
    pub stop_point_ref: String,
    pub aimed_departure_time: Option<DateTime<Utc>>,
    pub expected_departure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub departure_status: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Extensions {
    #[serde(default)]
    pub national_operator_code: String,
}
