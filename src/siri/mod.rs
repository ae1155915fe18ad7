//! SIRI envelope shapes for the proxy. Only the elements the proxy
//! inspects are modelled; everything else passes through as raw bytes.

use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;

pub mod duration;

/// The envelope, deserialized just far enough to dispatch on the
/// conversation type.
#[derive(Debug, Default, Deserialize)]
pub struct Siri {
    #[serde(rename = "CapabilitiesRequest")]
    pub capabilities_request: Option<IgnoredAny>,
    #[serde(rename = "CheckStatusRequest")]
    pub check_status_request: Option<IgnoredAny>,
    #[serde(rename = "DataSupplyRequest")]
    pub data_supply_request: Option<IgnoredAny>,
    #[serde(rename = "HeartbeatNotification")]
    pub heartbeat_notification: Option<IgnoredAny>,
    #[serde(rename = "LinesRequest")]
    pub lines_request: Option<IgnoredAny>,
    #[serde(rename = "ProductCategoriesRequest")]
    pub product_categories_request: Option<IgnoredAny>,
    #[serde(rename = "ServiceDelivery")]
    pub service_delivery: Option<IgnoredAny>,
    #[serde(rename = "ServiceFeaturesRequest")]
    pub service_features_request: Option<IgnoredAny>,
    #[serde(rename = "ServiceRequest")]
    pub service_request: Option<IgnoredAny>,
    #[serde(rename = "StopPointsRequest")]
    pub stop_points_request: Option<IgnoredAny>,
    #[serde(rename = "SubscriptionRequest")]
    pub subscription_request: Option<SubscriptionRequest>,
    #[serde(rename = "SubscriptionResponse")]
    pub subscription_response: Option<SubscriptionResponse>,
    #[serde(rename = "TerminateSubscriptionRequest")]
    pub terminate_subscription_request: Option<TerminateSubscriptionRequest>,
    #[serde(rename = "VehicleFeaturesRequest")]
    pub vehicle_features_request: Option<IgnoredAny>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "RequestorRef")]
    pub requestor_ref: Option<String>,
    #[serde(rename = "ConsumerAddress")]
    pub consumer_address: Option<String>,
    #[serde(rename = "SubscriptionContext")]
    pub subscription_context: Option<SubscriptionContext>,
    #[serde(rename = "ConnectionMonitoringSubscriptionRequest", default)]
    pub connection_monitoring: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "ConnectionTimetableSubscriptionRequest", default)]
    pub connection_timetable: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "EstimatedTimetableSubscriptionRequest", default)]
    pub estimated_timetable: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "GeneralMessageSubscriptionRequest", default)]
    pub general_message: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "ProductionTimetableSubscriptionRequest", default)]
    pub production_timetable: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "StopMonitoringSubscriptionRequest", default)]
    pub stop_monitoring: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "StopTimetableSubscriptionRequest", default)]
    pub stop_timetable: Vec<ModalitySubscriptionRequest>,
    #[serde(rename = "VehicleMonitoringSubscriptionRequest", default)]
    pub vehicle_monitoring: Vec<ModalitySubscriptionRequest>,
}

impl SubscriptionRequest {
    /// Flattens the per-modality arrays in a stable order.
    pub fn all_subscriptions(&self) -> Vec<&ModalitySubscriptionRequest> {
        let mut subscriptions = Vec::new();
        for list in [
            &self.connection_monitoring,
            &self.connection_timetable,
            &self.estimated_timetable,
            &self.general_message,
            &self.production_timetable,
            &self.stop_monitoring,
            &self.stop_timetable,
            &self.vehicle_monitoring,
        ] {
            subscriptions.extend(list.iter());
        }
        subscriptions
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionContext {
    #[serde(rename = "HeartbeatInterval")]
    pub heartbeat_interval: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModalitySubscriptionRequest {
    #[serde(rename = "SubscriberRef")]
    pub subscriber_ref: Option<String>,
    #[serde(rename = "SubscriptionIdentifier")]
    pub subscription_identifier: Option<String>,
    #[serde(rename = "InitialTerminationTime")]
    pub initial_termination_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionResponse {
    #[serde(rename = "ResponderRef")]
    pub responder_ref: Option<String>,
    #[serde(rename = "ResponseStatus", default)]
    pub response_status: Vec<ResponseStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseStatus {
    #[serde(rename = "SubscriptionRef")]
    pub subscription_ref: Option<String>,
    #[serde(rename = "Status")]
    pub status: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateSubscriptionRequest {
    #[serde(rename = "RequestorRef")]
    pub requestor_ref: Option<String>,
    #[serde(rename = "All")]
    pub all: Option<String>,
    #[serde(rename = "SubscriptionRef", default)]
    pub subscription_ref: Vec<String>,
}

/// The two references read out of one service-delivery payload.
#[derive(Debug, Default, Deserialize)]
pub struct DeliveryRefs {
    #[serde(rename = "SubscriberRef", default)]
    pub subscriber_ref: String,
    #[serde(rename = "SubscriptionRef", default)]
    pub subscription_ref: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_dispatches_on_the_request_tag() {
        let body = r#"<Siri xmlns="http://www.siri.org.uk/siri" version="1.3">
            <CheckStatusRequest>
                <RequestTimestamp>2019-01-01T00:00:00Z</RequestTimestamp>
            </CheckStatusRequest>
        </Siri>"#;

        let siri: Siri = quick_xml::de::from_str(body).unwrap();
        assert!(siri.check_status_request.is_some());
        assert!(siri.subscription_request.is_none());
        assert!(siri.service_delivery.is_none());
    }

    #[test]
    fn subscription_request_flattens_modalities() {
        let body = r#"<Siri version="1.3">
          <SubscriptionRequest>
            <RequestTimestamp>2019-01-01T00:00:00Z</RequestTimestamp>
            <RequestorRef>FOO</RequestorRef>
            <ConsumerAddress>http://client/ingress</ConsumerAddress>
            <SubscriptionContext>
              <HeartbeatInterval>PT1M</HeartbeatInterval>
            </SubscriptionContext>
            <EstimatedTimetableSubscriptionRequest>
              <SubscriberRef>FOO</SubscriberRef>
              <SubscriptionIdentifier>123</SubscriptionIdentifier>
              <InitialTerminationTime>2030-01-01T00:00:00Z</InitialTerminationTime>
            </EstimatedTimetableSubscriptionRequest>
            <EstimatedTimetableSubscriptionRequest>
              <SubscriberRef>FOO</SubscriberRef>
              <SubscriptionIdentifier>456</SubscriptionIdentifier>
              <InitialTerminationTime>2030-01-01T00:00:00Z</InitialTerminationTime>
            </EstimatedTimetableSubscriptionRequest>
          </SubscriptionRequest>
        </Siri>"#;

        let siri: Siri = quick_xml::de::from_str(body).unwrap();
        let request = siri.subscription_request.unwrap();

        assert_eq!(request.requestor_ref.as_deref(), Some("FOO"));
        assert_eq!(
            request.consumer_address.as_deref(),
            Some("http://client/ingress")
        );
        assert_eq!(
            request
                .subscription_context
                .as_ref()
                .and_then(|c| c.heartbeat_interval.as_deref()),
            Some("PT1M")
        );

        let subscriptions = request.all_subscriptions();
        assert_eq!(subscriptions.len(), 2);
        assert_eq!(
            subscriptions[0].subscription_identifier.as_deref(),
            Some("123")
        );
        assert_eq!(
            subscriptions[1].subscription_identifier.as_deref(),
            Some("456")
        );
    }

    #[test]
    fn terminate_request_carries_all_or_refs() {
        let body = r#"<Siri version="1.3">
          <TerminateSubscriptionRequest>
            <RequestorRef>FOO</RequestorRef>
            <SubscriptionRef>123</SubscriptionRef>
            <SubscriptionRef>456</SubscriptionRef>
          </TerminateSubscriptionRequest>
        </Siri>"#;

        let siri: Siri = quick_xml::de::from_str(body).unwrap();
        let request = siri.terminate_subscription_request.unwrap();
        assert!(request.all.is_none());
        assert_eq!(request.subscription_ref, vec!["123", "456"]);

        let body = r#"<Siri version="1.3">
          <TerminateSubscriptionRequest>
            <RequestorRef>FOO</RequestorRef>
            <All/>
          </TerminateSubscriptionRequest>
        </Siri>"#;

        let siri: Siri = quick_xml::de::from_str(body).unwrap();
        let request = siri.terminate_subscription_request.unwrap();
        assert!(request.all.is_some());
    }

    #[test]
    fn delivery_refs_read_from_a_payload_fragment() {
        let fragment = r#"<EstimatedTimetableDelivery version="1.3">
            <ResponseTimestamp>2019-01-01T00:00:00Z</ResponseTimestamp>
            <SubscriberRef>FOO</SubscriberRef>
            <SubscriptionRef>123</SubscriptionRef>
            <Status>true</Status>
        </EstimatedTimetableDelivery>"#;

        let refs: DeliveryRefs = quick_xml::de::from_str(fragment).unwrap();
        assert_eq!(refs.subscriber_ref, "FOO");
        assert_eq!(refs.subscription_ref, "123");
    }
}
