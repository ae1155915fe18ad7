//! Splitting a published ServiceDelivery envelope into per-subscriber
//! payloads. This deliberately scans the raw text for the delivery
//! opening/closing tags: the envelope is forwarded byte-for-byte, so the
//! split must not re-serialize anything. The number of opening tags must
//! equal the number of closing tags; the region from the first opening to
//! the last closing tag is the payload area, and whatever surrounds it is
//! replayed around each regrouped payload.

use lazy_static::lazy_static;
use regex::Regex;

use departures_service::siri::DeliveryRefs;

lazy_static! {
    static ref DELIVERY_OPEN_RE: Regex = Regex::new(
        r"[ \t]*<(EstimatedTimetable|ProductionTimetable|StopMonitoring|StopTimetable|VehicleMonitoring)Delivery(\b|>)"
    )
    .unwrap();
    static ref DELIVERY_CLOSE_RE: Regex = Regex::new(
        r"</(EstimatedTimetable|ProductionTimetable|StopMonitoring|StopTimetable|VehicleMonitoring)Delivery>[\n\r]*"
    )
    .unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum DeliverySplitError {
    #[error("no service delivery payloads")]
    NoPayloads,
    #[error("no service delivery payload terminators")]
    NoTerminators,
    #[error("service delivery payload mismatch")]
    Mismatch,
    #[error("could not unmarshal service delivery XML: {0}")]
    Parse(#[from] quick_xml::DeError),
}

/// One outbound delivery: every payload for the same
/// `(subscriberRef, subscriptionRef)` concatenated in input order, wrapped
/// in the original envelope's header and footer.
#[derive(Debug, PartialEq, Eq)]
pub struct GroupedDelivery {
    pub subscriber_ref: String,
    pub subscription_ref: String,
    pub body: String,
}

pub fn split_and_group(body: &str) -> Result<Vec<GroupedDelivery>, DeliverySplitError> {
    let opens: Vec<(usize, usize)> = DELIVERY_OPEN_RE
        .find_iter(body)
        .map(|m| (m.start(), m.end()))
        .collect();
    if opens.is_empty() {
        return Err(DeliverySplitError::NoPayloads);
    }

    let closes: Vec<(usize, usize)> = DELIVERY_CLOSE_RE
        .find_iter(body)
        .map(|m| (m.start(), m.end()))
        .collect();
    if closes.is_empty() {
        return Err(DeliverySplitError::NoTerminators);
    }

    if opens.len() != closes.len() {
        return Err(DeliverySplitError::Mismatch);
    }

    let header = &body[..opens[0].0];
    let footer = &body[closes[closes.len() - 1].1..];

    struct Entry {
        subscriber_ref: String,
        subscription_ref: String,
        payload: String,
    }

    let mut deliveries: Vec<Entry> = Vec::new();

    for i in 0..opens.len() {
        let payload = &body[opens[i].0..closes[i].1];
        let refs: DeliveryRefs = quick_xml::de::from_str(payload.trim_start())?;

        match deliveries.iter_mut().find(|d| {
            d.subscriber_ref == refs.subscriber_ref && d.subscription_ref == refs.subscription_ref
        }) {
            Some(existing) => existing.payload.push_str(payload),
            None => deliveries.push(Entry {
                subscriber_ref: refs.subscriber_ref,
                subscription_ref: refs.subscription_ref,
                payload: payload.to_string(),
            }),
        }
    }

    Ok(deliveries
        .into_iter()
        .map(|d| GroupedDelivery {
            subscriber_ref: d.subscriber_ref,
            subscription_ref: d.subscription_ref,
            body: format!("{header}{}{footer}", d.payload),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(subscriber: &str, subscription: &str, journey: &str) -> String {
        format!(
            "  <EstimatedTimetableDelivery version=\"1.3\">\n    <SubscriberRef>{subscriber}</SubscriberRef>\n    <SubscriptionRef>{subscription}</SubscriptionRef>\n    <EstimatedJourneyVersionFrame>{journey}</EstimatedJourneyVersionFrame>\n  </EstimatedTimetableDelivery>\n"
        )
    }

    fn envelope(deliveries: &[String]) -> String {
        format!(
            "<Siri xmlns=\"http://www.siri.org.uk/siri\" version=\"1.3\">\n<ServiceDelivery>\n<ProducerRef>upstream</ProducerRef>\n{}</ServiceDelivery>\n</Siri>",
            deliveries.concat()
        )
    }

    #[test]
    fn four_deliveries_group_into_two_by_subscription() {
        let d1 = delivery("FOO", "123", "a");
        let d2 = delivery("FOO", "123", "b");
        let d3 = delivery("FOO", "456", "c");
        let d4 = delivery("FOO", "456", "d");
        let body = envelope(&[d1.clone(), d3.clone(), d2.clone(), d4.clone()]);

        let groups = split_and_group(&body).unwrap();
        assert_eq!(groups.len(), 2);

        let header = "<Siri xmlns=\"http://www.siri.org.uk/siri\" version=\"1.3\">\n<ServiceDelivery>\n<ProducerRef>upstream</ProducerRef>\n";
        let footer = "</ServiceDelivery>\n</Siri>";

        // Payloads for the same subscription are concatenated in input
        // order inside the original header and footer.
        assert_eq!(groups[0].subscriber_ref, "FOO");
        assert_eq!(groups[0].subscription_ref, "123");
        assert_eq!(groups[0].body, format!("{header}{d1}{d2}{footer}"));

        assert_eq!(groups[1].subscription_ref, "456");
        assert_eq!(groups[1].body, format!("{header}{d3}{d4}{footer}"));
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let body = "<Siri><ServiceDelivery><EstimatedTimetableDelivery><SubscriberRef>FOO</SubscriberRef><SubscriptionRef>1</SubscriptionRef></EstimatedTimetableDelivery><StopMonitoringDelivery></ServiceDelivery></Siri>";
        assert!(matches!(
            split_and_group(body),
            Err(DeliverySplitError::Mismatch)
        ));
    }

    #[test]
    fn an_envelope_without_deliveries_is_rejected() {
        let body = "<Siri><ServiceDelivery><ProducerRef>x</ProducerRef></ServiceDelivery></Siri>";
        assert!(matches!(
            split_and_group(body),
            Err(DeliverySplitError::NoPayloads)
        ));
    }
}
