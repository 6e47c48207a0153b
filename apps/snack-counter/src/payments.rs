use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

type HmacSha256 = Hmac<sha2::Sha256>;

const CHECKOUT_SESSIONS_URL: &str = "https://api.stripe.com/v1/checkout/sessions";
const SIGNATURE_TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("processor rejected request: status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("checkout response missing redirect url")]
    MissingUrl,
    #[error("webhook secret not configured")]
    WebhookDisabled,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature timestamp outside tolerance")]
    StaleSignature,
    #[error("webhook signature mismatch")]
    SignatureMismatch,
    #[error("webhook payload is not valid json: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Payment-processor adapter: creates checkout sessions and verifies the
/// completion webhook. Owns no orchestration state.
#[derive(Clone)]
pub struct PaymentsClient {
    secret_key: String,
    webhook_secret: Option<String>,
    currency: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: CheckoutSession,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutCreated {
    url: Option<String>,
}

impl PaymentsClient {
    pub fn new(secret_key: String, webhook_secret: Option<String>, currency: String) -> Self {
        Self {
            secret_key,
            webhook_secret,
            currency,
            client: Client::new(),
        }
    }

    /// Create a checkout session for a tip and return the redirect URL.
    /// The room tag and connection handle travel in the session metadata so
    /// the completion webhook can be correlated back.
    pub async fn create_checkout(
        &self,
        amount: u64,
        room_tag: &str,
        handle: &str,
        return_origin: &str,
    ) -> Result<String, PaymentError> {
        let amount_str = amount.to_string();
        let product_name = format!("Tip {amount}");
        let success_url = format!(
            "{return_origin}/return?tip=success&room_tag={room_tag}&session_id={{CHECKOUT_SESSION_ID}}"
        );
        let cancel_url = format!("{return_origin}/return?tip=cancel&room_tag={room_tag}");

        let params = [
            ("mode", "payment"),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", self.currency.as_str()),
            ("line_items[0][price_data][unit_amount]", amount_str.as_str()),
            (
                "line_items[0][price_data][product_data][name]",
                product_name.as_str(),
            ),
            ("success_url", success_url.as_str()),
            ("cancel_url", cancel_url.as_str()),
            ("metadata[room_tag]", room_tag),
            ("metadata[handle]", handle),
        ];

        let response = self
            .client
            .post(CHECKOUT_SESSIONS_URL)
            .bearer_auth(&self.secret_key)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Api { status, body });
        }

        let created: CheckoutCreated = response.json().await?;
        created.url.ok_or(PaymentError::MissingUrl)
    }

    /// Verify a webhook delivery against the `t=...,v1=...` signature
    /// header and parse the event. The MAC is computed over
    /// `"{timestamp}.{payload}"`; the timestamp must be within tolerance.
    pub fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<WebhookEvent, PaymentError> {
        let secret = self
            .webhook_secret
            .as_ref()
            .ok_or(PaymentError::WebhookDisabled)?;

        let (timestamp, signatures) = parse_signature_header(signature_header)?;
        if (Utc::now().timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(PaymentError::StaleSignature);
        }

        let verified = signatures.iter().any(|candidate| {
            let Some(candidate) = decode_hex(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&candidate).is_ok()
        });
        if !verified {
            return Err(PaymentError::SignatureMismatch);
        }

        Ok(serde_json::from_slice(payload)?)
    }
}

fn parse_signature_header(header: &str) -> Result<(i64, Vec<&str>), PaymentError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    match (timestamp, signatures.is_empty()) {
        (Some(timestamp), false) => Ok((timestamp, signatures)),
        _ => Err(PaymentError::MalformedSignature),
    }
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn client(secret: &str) -> PaymentsClient {
        PaymentsClient::new(
            "sk_test_dummy".into(),
            Some(secret.into()),
            "jpy".into(),
        )
    }

    const PAYLOAD: &[u8] = br#"{
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": "cs_test_1",
            "amount_total": 1500,
            "metadata": {"room_tag": "room_x", "handle": "h-1"}
        }}
    }"#;

    #[test]
    fn accepts_valid_signature() {
        let payments = client("whsec_test");
        let timestamp = Utc::now().timestamp();
        let header = format!("t={timestamp},v1={}", sign("whsec_test", timestamp, PAYLOAD));

        let event = payments.verify_webhook(PAYLOAD, &header).unwrap();
        assert_eq!(event.kind, "checkout.session.completed");
        assert_eq!(event.data.object.id, "cs_test_1");
        assert_eq!(event.data.object.amount_total, Some(1500));
        assert_eq!(
            event.data.object.metadata.get("room_tag").map(String::as_str),
            Some("room_x")
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let payments = client("whsec_test");
        let timestamp = Utc::now().timestamp();
        let header = format!("t={timestamp},v1={}", sign("whsec_test", timestamp, PAYLOAD));

        let tampered = PAYLOAD.to_vec().repeat(2);
        assert!(matches!(
            payments.verify_webhook(&tampered, &header),
            Err(PaymentError::SignatureMismatch)
        ));
    }

    #[test]
    fn rejects_wrong_secret() {
        let payments = client("whsec_test");
        let timestamp = Utc::now().timestamp();
        let header = format!("t={timestamp},v1={}", sign("whsec_other", timestamp, PAYLOAD));

        assert!(matches!(
            payments.verify_webhook(PAYLOAD, &header),
            Err(PaymentError::SignatureMismatch)
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payments = client("whsec_test");
        let timestamp = Utc::now().timestamp() - SIGNATURE_TOLERANCE_SECS - 60;
        let header = format!("t={timestamp},v1={}", sign("whsec_test", timestamp, PAYLOAD));

        assert!(matches!(
            payments.verify_webhook(PAYLOAD, &header),
            Err(PaymentError::StaleSignature)
        ));
    }

    #[test]
    fn rejects_malformed_header() {
        let payments = client("whsec_test");
        for header in ["", "garbage", "t=notanumber,v1=aa", "v1=aa", "t=123"] {
            assert!(matches!(
                payments.verify_webhook(PAYLOAD, header),
                Err(PaymentError::MalformedSignature)
            ));
        }
    }

    #[test]
    fn rejects_when_webhook_secret_missing() {
        let payments = PaymentsClient::new("sk_test_dummy".into(), None, "jpy".into());
        assert!(matches!(
            payments.verify_webhook(PAYLOAD, "t=1,v1=aa"),
            Err(PaymentError::WebhookDisabled)
        ));
    }
}
