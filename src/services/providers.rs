//! Thin clients for the external settlement providers. Wire formats are
//! opaque capability interfaces: the only contract is a success terminal
//! state plus an opaque reference id used for ledger idempotency.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("charge declined: {0}")]
    Declined(String),
    #[error("malformed provider response")]
    BadResponse,
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub struct PaypalOrder {
    pub id: String,
    pub approve_url: String,
}

/// Charge the card processor for `gross_amount` (total + provider fee).
/// Returns the opaque charge id. Anything other than a `succeeded` terminal
/// state is an error and nothing is written to the ledger.
pub async fn charge_card(
    http: &reqwest::Client,
    settings: &Settings,
    payment_method_id: &str,
    gross_amount: i64,
) -> ProviderResult<String> {
    let resp = http
        .post(format!("{}/v1/charges", settings.card_api_base))
        .bearer_auth(&settings.card_secret_key)
        .json(&json!({
            "amount": gross_amount,
            "currency": "usd",
            "payment_method": payment_method_id,
            "confirm": true,
        }))
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(ProviderError::Declined(format!("HTTP {}", resp.status())));
    }
    let body: Value = resp.json().await?;
    match body["status"].as_str() {
        Some("succeeded") => {}
        Some(other) => return Err(ProviderError::Declined(other.to_string())),
        None => return Err(ProviderError::BadResponse),
    }
    body["id"]
        .as_str()
        .map(str::to_string)
        .ok_or(ProviderError::BadResponse)
}

/// First PayPal round trip: create the provider-side order and hand back the
/// approval URL the user must visit before capture.
pub async fn create_paypal_order(
    http: &reqwest::Client,
    settings: &Settings,
    gross_amount: i64,
    order_number: &str,
) -> ProviderResult<PaypalOrder> {
    let resp = http
        .post(format!("{}/v2/checkout/orders", settings.paypal_api_base))
        .basic_auth(&settings.paypal_client_id, Some(&settings.paypal_secret))
        .json(&json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": order_number,
                "amount": { "currency_code": "USD", "value": format_major(gross_amount) },
            }],
        }))
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(ProviderError::Declined(format!("HTTP {}", resp.status())));
    }
    let body: Value = resp.json().await?;
    let id = body["id"].as_str().ok_or(ProviderError::BadResponse)?;
    let approve_url = body["links"]
        .as_array()
        .and_then(|links| {
            links
                .iter()
                .find(|l| l["rel"].as_str() == Some("approve"))
                .and_then(|l| l["href"].as_str())
        })
        .ok_or(ProviderError::BadResponse)?;
    Ok(PaypalOrder {
        id: id.to_string(),
        approve_url: approve_url.to_string(),
    })
}

/// Second PayPal round trip: capture a previously approved order. Returns
/// the capture id once the provider reports a COMPLETED state.
pub async fn capture_paypal_order(
    http: &reqwest::Client,
    settings: &Settings,
    paypal_order_id: &str,
) -> ProviderResult<String> {
    let resp = http
        .post(format!(
            "{}/v2/checkout/orders/{}/capture",
            settings.paypal_api_base, paypal_order_id
        ))
        .basic_auth(&settings.paypal_client_id, Some(&settings.paypal_secret))
        .json(&json!({}))
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(ProviderError::Declined(format!("HTTP {}", resp.status())));
    }
    let body: Value = resp.json().await?;
    match body["status"].as_str() {
        Some("COMPLETED") => {}
        Some(other) => return Err(ProviderError::Declined(other.to_string())),
        None => return Err(ProviderError::BadResponse),
    }
    let capture_id = body["purchase_units"][0]["payments"]["captures"][0]["id"]
        .as_str()
        .unwrap_or(paypal_order_id);
    Ok(capture_id.to_string())
}

fn format_major(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

/// Verify a `t=<unix>,v1=<hex>` signature header: HMAC-SHA256 of
/// `"{timestamp}.{payload}"` under the webhook secret, compared in constant
/// time. A missing or malformed header never verifies.
pub fn verify_webhook_signature(secret: &str, header: &str, payload: &[u8]) -> bool {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => signature = Some(v),
            _ => {}
        }
    }
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };

    let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);
    let expected = hmac_sha256(secret.as_bytes(), &signed);

    constant_time_eq(&expected, &provided)
}

/// Produce a `t=<unix>,v1=<hex>` header value for `payload` under `secret`.
/// Counterpart of [`verify_webhook_signature`], used by test harnesses and
/// local delivery tooling.
pub fn sign_webhook_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(payload);
    format!(
        "t={timestamp},v1={}",
        hex::encode(hmac_sha256(secret.as_bytes(), &signed))
    )
}

/// HMAC-SHA256 (RFC 2104) over SHA-256.
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK: usize = 64;
    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        key_block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231 test case 2.
    #[test]
    fn hmac_sha256_matches_rfc_vector() {
        let digest = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(digest),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn valid_signature_verifies() {
        let payload = b"{\"type\":\"payment_intent.succeeded\"}";
        let header = sign_webhook_payload("whsec_test", 1_700_000_000, payload);
        assert!(verify_webhook_signature("whsec_test", &header, payload));
    }

    #[test]
    fn tampered_payload_fails() {
        let header = sign_webhook_payload("whsec_test", 1_700_000_000, b"{\"amount\":100}");
        assert!(!verify_webhook_signature(
            "whsec_test",
            &header,
            b"{\"amount\":999}"
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign_webhook_payload("whsec_a", 1, b"{}");
        assert!(!verify_webhook_signature("whsec_b", &header, b"{}"));
    }

    #[test]
    fn malformed_header_fails() {
        assert!(!verify_webhook_signature("s", "", b"{}"));
        assert!(!verify_webhook_signature("s", "t=123", b"{}"));
        assert!(!verify_webhook_signature("s", "v1=zz,t=1", b"{}"));
    }

    #[test]
    fn minor_units_format_as_major() {
        assert_eq!(format_major(10000), "100.00");
        assert_eq!(format_major(105), "1.05");
        assert_eq!(format_major(30), "0.30");
    }
}
