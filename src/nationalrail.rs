//! National Rail OpenLDBWS: the SOAP client used by the rail poller and
//! the station-board shapes shared with the rail ingester (XML on the way
//! in, JSON between the stages).

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref TAG_PREFIX_RE: Regex = Regex::new(r"<(/?)[A-Za-z0-9_]+:").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum NationalRailError {
    #[error("cannot reach OpenLDBWS: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("OpenLDBWS returned status {0}")]
    Status(u16),
    #[error("cannot read OpenLDBWS response: {0}")]
    Read(#[source] reqwest::Error),
    #[error("cannot unmarshal station board: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("response carries no station board")]
    MissingBoard,
}

/// SOAP responses qualify every element (`soap:`, `lt4:`, `lt5:` …). The
/// prefixes vary by schema revision and carry no information we need, so
/// they are stripped from tag names before deserialization.
pub fn strip_namespace_prefixes(xml: &str) -> String {
    TAG_PREFIX_RE.replace_all(xml, "<$1").into_owned()
}

pub struct LdbClient {
    pub client: reqwest::Client,
    pub url: String,
    pub access_token: String,
}

impl LdbClient {
    pub async fn get_departure_board(&self, crs: &str) -> Result<StationBoard, NationalRailError> {
        let request = self.departure_board_request(crs);

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .header(
                "SOAPAction",
                "http://thalesgroup.com/RTTI/2012-01-13/ldb/GetDepartureBoard",
            )
            .body(request)
            .send()
            .await
            .map_err(NationalRailError::Unreachable)?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(NationalRailError::Status(status));
        }

        let body = response.text().await.map_err(NationalRailError::Read)?;
        let envelope: SoapEnvelope = quick_xml::de::from_str(&strip_namespace_prefixes(&body))?;

        envelope
            .body
            .get_departure_board_response
            .and_then(|r| r.get_station_board_result)
            .ok_or(NationalRailError::MissingBoard)
    }

    fn departure_board_request(&self, crs: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:typ="http://thalesgroup.com/RTTI/2013-11-28/Token/types" xmlns:ldb="http://thalesgroup.com/RTTI/2017-10-01/ldb/">
    <soap:Header>
        <typ:AccessToken>
            <typ:TokenValue>{token}</typ:TokenValue>
        </typ:AccessToken>
    </soap:Header>
    <soap:Body>
        <ldb:GetDepartureBoardRequest>
            <ldb:crs>{crs}</ldb:crs>
        </ldb:GetDepartureBoardRequest>
    </soap:Body>
</soap:Envelope>"#,
            token = self.access_token,
            crs = crs
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct SoapEnvelope {
    #[serde(rename = "Body", default)]
    body: SoapBody,
}

#[derive(Debug, Default, Deserialize)]
struct SoapBody {
    #[serde(rename = "GetDepartureBoardResponse")]
    get_departure_board_response: Option<GetDepartureBoardResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct GetDepartureBoardResponse {
    #[serde(rename = "GetStationBoardResult")]
    get_station_board_result: Option<StationBoard>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationBoard {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub crs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_services: Option<ArrayOfServiceItems>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ArrayOfServiceItems {
    #[serde(default)]
    pub service: Vec<ServiceItem>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_code: Option<String>,
    #[serde(rename = "serviceID", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<ArrayOfServiceLocations>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ArrayOfServiceLocations {
    #[serde(default)]
    pub location: Vec<ServiceLocation>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub crs: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub via: String,
}
