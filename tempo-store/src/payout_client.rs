use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tempo_core::payment::{PayoutInstruction, PayoutProvider, ProviderError, ProviderPayout, RefundReceipt};
use tracing::{error, info};

use crate::app_config::PayoutProviderConfig;

/// UPI payout and payment-refund gateway over HTTP.
#[derive(Clone)]
pub struct HttpPayoutProvider {
    http: Client,
    config: PayoutProviderConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiatePayoutBody<'a> {
    /// Major currency units
    amount: f64,
    #[serde(rename = "payment_mode")]
    payment_mode: &'a str,
    #[serde(rename = "reference_id")]
    reference_id: &'a str,
    #[serde(rename = "transcation_note")]
    transaction_note: &'a str,
    beneficiary_name: &'a str,
    upi: &'a str,
}

#[derive(Serialize)]
struct FetchStatusBody<'a> {
    #[serde(rename = "transcation_id")]
    transaction_id: &'a str,
}

#[derive(Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayoutData {
    #[serde(rename = "transcation_id")]
    transaction_id: String,
    status: String,
    #[serde(default)]
    utr: Option<String>,
    #[serde(default)]
    status_description: Option<String>,
}

#[derive(Serialize)]
struct RefundBody<'a> {
    amount: i64,
    speed: &'a str,
    notes: RefundNotes<'a>,
}

#[derive(Serialize)]
struct RefundNotes<'a> {
    reason: &'a str,
}

#[derive(Deserialize)]
struct RefundData {
    id: String,
    amount: i64,
}

impl From<PayoutData> for ProviderPayout {
    fn from(d: PayoutData) -> Self {
        Self {
            transaction_id: d.transaction_id,
            status: d.status,
            utr: d.utr,
            description: d.status_description,
        }
    }
}

fn transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Transient(err.to_string())
    } else if err.is_decode() {
        ProviderError::Rejected(format!("unreadable response: {}", err))
    } else {
        ProviderError::Transient(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    error!("Payout provider returned {}: {}", status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ProviderError::Transient(format!("HTTP {}", status)))
    } else {
        Err(ProviderError::Rejected(format!("HTTP {}: {}", status, body)))
    }
}

impl HttpPayoutProvider {
    pub fn new(config: PayoutProviderConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { http, config })
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/{}", self.config.base_url.trim_end_matches('/'), path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let envelope: Envelope<T> = check_status(response).await?.json().await.map_err(transport)?;
        if !envelope.status {
            return Err(ProviderError::Rejected(
                envelope.message.unwrap_or_else(|| format!("{} refused", path)),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ProviderError::Rejected(format!("{} returned no data", path)))
    }
}

#[async_trait]
impl PayoutProvider for HttpPayoutProvider {
    async fn initiate_payout(&self, instruction: &PayoutInstruction) -> Result<ProviderPayout, ProviderError> {
        let body = InitiatePayoutBody {
            amount: instruction.amount as f64 / 100.0,
            payment_mode: "UPI",
            reference_id: &instruction.reference_id,
            transaction_note: &instruction.purpose,
            beneficiary_name: &instruction.beneficiary_name,
            upi: instruction.destination.expose(),
        };

        let data: PayoutData = self.call("initiatepayout", &body).await?;
        info!(
            "Payout {} accepted as {} ({}) for {}",
            instruction.reference_id, data.transaction_id, data.status, instruction.destination
        );
        Ok(data.into())
    }

    async fn fetch_status(&self, transaction_id: &str) -> Result<ProviderPayout, ProviderError> {
        let data: PayoutData = self.call("fetchStatus", &FetchStatusBody { transaction_id }).await?;
        Ok(data.into())
    }

    async fn refund(&self, payment_id: &str, amount: i64, note: &str) -> Result<RefundReceipt, ProviderError> {
        let url = format!(
            "{}/payments/{}/refund",
            self.config.payments_base_url.trim_end_matches('/'),
            payment_id
        );
        let body = RefundBody {
            amount,
            speed: "normal",
            notes: RefundNotes { reason: note },
        };

        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let data: RefundData = check_status(response).await?.json().await.map_err(transport)?;
        info!("Refund {} issued for payment {}", data.id, payment_id);
        Ok(RefundReceipt {
            refund_id: data.id,
            amount: data.amount,
        })
    }
}
