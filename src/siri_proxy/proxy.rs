//! The proxy itself: envelope dispatch, verbatim pass-through, the
//! subscription store, and the consumer-address re-homing of subscription
//! requests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use departures_service::siri::duration::IsoDuration;
use departures_service::siri::{Siri, SubscriptionRequest, TerminateSubscriptionRequest};

use crate::delivery::split_and_group;
use crate::heartbeat::{initialise_heartbeat_notifications, reconcile_heartbeats, HeartbeatEntry};

lazy_static! {
    static ref CONSUMER_ADDRESS_RE: Regex =
        Regex::new("<ConsumerAddress>(.+)</ConsumerAddress>").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub consumer_address: String,
    pub requestor_ref: String,
    pub subscription_ref: String,
    pub initial_termination_time: DateTime<Utc>,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("RequestorRef cannot be empty")]
    MissingRequestorRef,
    #[error("SubscriptionRef cannot be empty if the All key is not set")]
    MissingSubscriptionRef,
}

pub struct ProxyState {
    pub server_url: String,
    pub target_url: String,
    pub client: reqwest::Client,
    pub default_heartbeat_interval: Duration,
    pub subscriptions: Mutex<Vec<Subscription>>,
    pub latest_heartbeat: Mutex<Option<Vec<u8>>>,
    pub heartbeats: Mutex<HashMap<String, HeartbeatEntry>>,
}

impl ProxyState {
    pub fn new(
        server_url: String,
        target_url: String,
        client: reqwest::Client,
        default_heartbeat_interval: Duration,
    ) -> Self {
        ProxyState {
            server_url,
            target_url,
            client,
            default_heartbeat_interval,
            subscriptions: Mutex::new(Vec::new()),
            latest_heartbeat: Mutex::new(None),
            heartbeats: Mutex::new(HashMap::new()),
        }
    }
}

pub async fn handle(state: web::Data<ProxyState>, body: web::Bytes) -> HttpResponse {
    log::debug!("handle");

    let Ok(text) = std::str::from_utf8(&body) else {
        log::warn!("request body is not valid UTF-8");
        return HttpResponse::BadRequest().finish();
    };

    let envelope: Siri = match quick_xml::de::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("could not unmarshal request to SIRI: {e}");
            return HttpResponse::BadRequest().finish();
        }
    };

    // Request/response conversations pass through verbatim.
    if envelope.capabilities_request.is_some()
        || envelope.check_status_request.is_some()
        || envelope.lines_request.is_some()
        || envelope.product_categories_request.is_some()
        || envelope.service_features_request.is_some()
        || envelope.stop_points_request.is_some()
        || envelope.vehicle_features_request.is_some()
        || envelope.service_request.is_some()
        || envelope.data_supply_request.is_some()
    {
        return forward_verbatim(&state, &body, "application/xml").await;
    }

    if let Some(request) = &envelope.subscription_request {
        return handle_subscription_request(state, text, request).await;
    }

    if let Some(request) = &envelope.terminate_subscription_request {
        {
            let mut subscriptions = state.subscriptions.lock().expect("subscriptions lock");
            if let Err(e) = remove_subscriptions(&mut subscriptions, request) {
                log::warn!("could not remove subscription: {e}");
                return HttpResponse::BadRequest().finish();
            }
        }
        reconcile_heartbeats(&state.clone().into_inner());
        return forward_verbatim(&state, &body, "application/xml").await;
    }

    if envelope.service_delivery.is_some() {
        return handle_service_delivery_publication(&state, text).await;
    }

    if envelope.heartbeat_notification.is_some() {
        *state
            .latest_heartbeat
            .lock()
            .expect("latest heartbeat lock") = Some(body.to_vec());
        return HttpResponse::Ok().finish();
    }

    HttpResponse::Ok().finish()
}

async fn forward_verbatim(state: &ProxyState, body: &[u8], content_type: &str) -> HttpResponse {
    log::debug!("forward to {}", state.target_url);

    let response = state
        .client
        .post(&state.target_url)
        .header("Content-Type", content_type)
        .body(body.to_vec())
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            log::warn!("request to target failed: {e}");
            return HttpResponse::BadGateway().finish();
        }
    };

    copy_response(response).await
}

/// Replays the upstream response, headers and body, to the caller.
async fn copy_response(response: reqwest::Response) -> HttpResponse {
    let mut builder = HttpResponse::Ok();

    for (name, value) in response.headers() {
        if *name == reqwest::header::CONTENT_LENGTH
            || *name == reqwest::header::TRANSFER_ENCODING
            || *name == reqwest::header::CONNECTION
        {
            continue;
        }
        builder.append_header((name.as_str(), value.as_bytes()));
    }

    match response.bytes().await {
        Ok(body) => builder.body(body),
        Err(e) => {
            log::warn!("cannot read target response: {e}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn handle_subscription_request(
    state: web::Data<ProxyState>,
    raw_body: &str,
    request: &SubscriptionRequest,
) -> HttpResponse {
    log::debug!("handle subscription request");

    let Some(requestor_ref) = request.requestor_ref.as_deref().filter(|r| !r.is_empty()) else {
        log::warn!("RequestorRef cannot be empty");
        return HttpResponse::BadRequest().finish();
    };

    let Some(consumer_address) = request
        .consumer_address
        .as_deref()
        .filter(|a| !a.is_empty())
    else {
        log::warn!("ConsumerAddress cannot be empty");
        return HttpResponse::BadRequest().finish();
    };

    let heartbeat_interval = match request
        .subscription_context
        .as_ref()
        .and_then(|c| c.heartbeat_interval.as_deref())
    {
        Some(value) => match IsoDuration::parse(value) {
            Ok(duration) => duration.to_std(),
            Err(_) => {
                log::warn!("HeartbeatInterval value is invalid");
                return HttpResponse::BadRequest().finish();
            }
        },
        None => state.default_heartbeat_interval,
    };

    let mut subscriptions_to_store = Vec::new();
    for subscription in request.all_subscriptions() {
        let Some(identifier) = subscription.subscription_identifier.as_deref() else {
            log::warn!("SubscriptionIdentifier cannot be empty");
            return HttpResponse::BadRequest().finish();
        };
        let Some(termination) = subscription.initial_termination_time else {
            log::warn!("InitialTerminationTime cannot be empty");
            return HttpResponse::BadRequest().finish();
        };

        subscriptions_to_store.push(Subscription {
            consumer_address: consumer_address.to_string(),
            requestor_ref: requestor_ref.to_string(),
            subscription_ref: identifier.to_string(),
            initial_termination_time: termination,
            heartbeat_interval,
        });
    }

    // Re-home the consumer address so published data flows through here.
    if !CONSUMER_ADDRESS_RE.is_match(raw_body) {
        log::warn!("subscription request carries no ConsumerAddress element");
        return HttpResponse::BadRequest().finish();
    }
    let rewritten = rewrite_consumer_address(raw_body, consumer_address, &state.server_url);

    let response = state
        .client
        .post(&state.target_url)
        .header("Content-Type", "text/xml")
        .body(rewritten)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            log::warn!("subscription request to target failed: {e}");
            return HttpResponse::BadGateway().finish();
        }
    };

    let headers = response.headers().clone();
    let response_body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("cannot read subscription response: {e}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    let response_text = match std::str::from_utf8(&response_body) {
        Ok(text) => text,
        Err(_) => {
            log::warn!("subscription response is not valid UTF-8");
            return HttpResponse::InternalServerError().finish();
        }
    };

    let response_envelope: Siri = match quick_xml::de::from_str(response_text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("could not unmarshal response to SIRI: {e}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    let Some(subscription_response) = &response_envelope.subscription_response else {
        log::warn!("SubscriptionRequest failed:\n{response_text}");
        return HttpResponse::BadRequest().finish();
    };

    // Only subscriptions the upstream accepted are stored.
    let mut successful = Vec::new();
    for status in &subscription_response.response_status {
        let Some(subscription_ref) = status.subscription_ref.as_deref() else {
            log::warn!("SubscriptionRef cannot be empty");
            return HttpResponse::InternalServerError().finish();
        };
        let Some(accepted) = status.status else {
            log::warn!("Status cannot be empty");
            return HttpResponse::InternalServerError().finish();
        };

        if accepted {
            for subscription in &subscriptions_to_store {
                if subscription.subscription_ref == subscription_ref {
                    successful.push(subscription.clone());
                }
            }
        }
    }

    {
        let mut subscriptions = state.subscriptions.lock().expect("subscriptions lock");
        store_subscriptions(&mut subscriptions, successful);
    }

    initialise_heartbeat_notifications(
        state.clone().into_inner(),
        consumer_address.to_string(),
    );

    let mut builder = HttpResponse::Ok();
    for (name, value) in &headers {
        if *name == reqwest::header::CONTENT_LENGTH
            || *name == reqwest::header::TRANSFER_ENCODING
            || *name == reqwest::header::CONNECTION
        {
            continue;
        }
        builder.append_header((name.as_str(), value.as_bytes()));
    }
    builder.body(response_body)
}

async fn handle_service_delivery_publication(state: &ProxyState, body: &str) -> HttpResponse {
    log::debug!("handle service delivery publication");

    let groups = match split_and_group(body) {
        Ok(groups) => groups,
        Err(e) => {
            log::warn!("{e}");
            return HttpResponse::InternalServerError().finish();
        }
    };

    for group in &groups {
        let consumers: Vec<String> = {
            let subscriptions = state.subscriptions.lock().expect("subscriptions lock");
            subscriptions
                .iter()
                .filter(|s| {
                    s.subscription_ref == group.subscription_ref
                        && s.requestor_ref == group.subscriber_ref
                })
                .map(|s| s.consumer_address.clone())
                .collect()
        };

        for consumer in consumers {
            let response = state
                .client
                .post(&consumer)
                .header("Content-Type", "application/xml")
                .body(group.body.clone())
                .send()
                .await;

            match response {
                Ok(response) if response.status().as_u16() < 300 => {}
                Ok(response) => {
                    log::warn!(
                        "bad response for HTTP request to {consumer}: {}",
                        response.status()
                    );
                    return HttpResponse::InternalServerError().finish();
                }
                Err(e) => {
                    log::warn!("HTTP request to {consumer} failed: {e}");
                    return HttpResponse::InternalServerError().finish();
                }
            }
        }
    }

    HttpResponse::Ok().finish()
}

/// A single textual substitution of the subscriber's own address for the
/// proxy's.
pub fn rewrite_consumer_address(body: &str, consumer_address: &str, server_url: &str) -> String {
    body.replacen(consumer_address, server_url, 1)
}

/// Replaces stored subscriptions superseded by the new set, drops
/// duplicate keys within the new set, and appends what remains.
pub fn store_subscriptions(stored: &mut Vec<Subscription>, mut to_store: Vec<Subscription>) {
    stored.retain(|subscription| {
        !to_store.iter().any(|new| {
            new.requestor_ref == subscription.requestor_ref
                && new.subscription_ref == subscription.subscription_ref
        })
    });

    let mut seen = HashSet::new();
    to_store.retain(|subscription| {
        seen.insert((
            subscription.requestor_ref.clone(),
            subscription.subscription_ref.clone(),
        ))
    });

    stored.extend(to_store);
}

pub fn remove_subscriptions(
    stored: &mut Vec<Subscription>,
    request: &TerminateSubscriptionRequest,
) -> Result<(), TerminateError> {
    let requestor_ref = request
        .requestor_ref
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or(TerminateError::MissingRequestorRef)?;

    if request.all.is_some() {
        stored.retain(|subscription| subscription.requestor_ref != requestor_ref);
        return Ok(());
    }

    if request.subscription_ref.is_empty() {
        return Err(TerminateError::MissingSubscriptionRef);
    }

    for subscription_ref in &request.subscription_ref {
        stored.retain(|subscription| {
            !(subscription.requestor_ref == requestor_ref
                && &subscription.subscription_ref == subscription_ref)
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(requestor: &str, reference: &str) -> Subscription {
        Subscription {
            consumer_address: "http://client/ingress".to_string(),
            requestor_ref: requestor.to_string(),
            subscription_ref: reference.to_string(),
            initial_termination_time: Utc::now() + chrono::Duration::hours(1),
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn consumer_address_is_rehomed_once() {
        let body = concat!(
            "<Siri><SubscriptionRequest>",
            "<ConsumerAddress>http://client/ingress</ConsumerAddress>",
            "<Note>http://client/ingress</Note>",
            "</SubscriptionRequest></Siri>"
        );

        let rewritten = rewrite_consumer_address(body, "http://client/ingress", "http://proxy:8080");

        assert!(rewritten
            .contains("<ConsumerAddress>http://proxy:8080</ConsumerAddress>"));
        // Only the first occurrence is substituted.
        assert!(rewritten.contains("<Note>http://client/ingress</Note>"));
    }

    #[test]
    fn storing_replaces_matching_keys_and_dedups_the_new_set() {
        let mut stored = vec![subscription("FOO", "123"), subscription("BAR", "9")];

        let mut replacement = subscription("FOO", "123");
        replacement.consumer_address = "http://client/new".to_string();

        store_subscriptions(
            &mut stored,
            vec![
                replacement.clone(),
                subscription("FOO", "123"),
                subscription("FOO", "456"),
            ],
        );

        assert_eq!(stored.len(), 3);
        assert!(stored.iter().any(|s| s.requestor_ref == "BAR"));

        let foo_123: Vec<&Subscription> = stored
            .iter()
            .filter(|s| s.requestor_ref == "FOO" && s.subscription_ref == "123")
            .collect();
        assert_eq!(foo_123.len(), 1);
        // The first occurrence in the new set won.
        assert_eq!(foo_123[0].consumer_address, "http://client/new");
    }

    #[test]
    fn terminate_all_removes_every_subscription_for_the_requestor() {
        let mut stored = vec![
            subscription("FOO", "123"),
            subscription("FOO", "456"),
            subscription("BAR", "9"),
        ];

        let request = TerminateSubscriptionRequest {
            requestor_ref: Some("FOO".to_string()),
            all: Some(String::new()),
            subscription_ref: Vec::new(),
        };

        remove_subscriptions(&mut stored, &request).unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].requestor_ref, "BAR");
    }

    #[test]
    fn terminate_by_reference_removes_only_the_named_subscriptions() {
        let mut stored = vec![
            subscription("FOO", "123"),
            subscription("FOO", "456"),
            subscription("BAR", "123"),
        ];

        let request = TerminateSubscriptionRequest {
            requestor_ref: Some("FOO".to_string()),
            all: None,
            subscription_ref: vec!["123".to_string()],
        };

        remove_subscriptions(&mut stored, &request).unwrap();

        assert_eq!(stored.len(), 2);
        assert!(stored
            .iter()
            .any(|s| s.requestor_ref == "FOO" && s.subscription_ref == "456"));
        assert!(stored
            .iter()
            .any(|s| s.requestor_ref == "BAR" && s.subscription_ref == "123"));
    }

    #[test]
    fn terminate_validates_its_inputs() {
        let mut stored = vec![subscription("FOO", "123")];

        let request = TerminateSubscriptionRequest::default();
        assert!(matches!(
            remove_subscriptions(&mut stored, &request),
            Err(TerminateError::MissingRequestorRef)
        ));

        let request = TerminateSubscriptionRequest {
            requestor_ref: Some("FOO".to_string()),
            all: None,
            subscription_ref: Vec::new(),
        };
        assert!(matches!(
            remove_subscriptions(&mut stored, &request),
            Err(TerminateError::MissingSubscriptionRef)
        ));

        assert_eq!(stored.len(), 1);
    }
}
