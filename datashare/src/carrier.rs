//! Adapter for the carrier's bundle-sharing API.
//!
//! [`CarrierClient`] owns the OTP-gated token lifecycle and the outbound
//! transfer and balance calls. [`Carrier`] is the seam the queue worker runs
//! against so tests can script outcomes without a network.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::UserId;

pub mod token;

use token::{TokenStatus, TokenStore, TokenSummary};

/// Hard ceiling on a single transfer.
pub const MAX_TRANSFER_GB: f64 = 5500.0;

/// International prefix assumed when a [`Carrier`] implementation does not
/// override [`Carrier::validate`].
pub const DEFAULT_COUNTRY_CODE: &str = "233";

const OTP_REQUEST_PATH: &str = "/api/auth/request-code";
const LOGIN_PATH: &str = "/api/auth/login";
const TRANSFER_PATH: &str = "/api/data-sharer/transfers";
const SUBSCRIPTIONS_PATH: &str = "/api/data-sharer/subscriptions";

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Auth(String),
    #[error("Carrier request failed")]
    Http(#[from] reqwest::Error),
    #[error("Token store in bad state")]
    BadState,
}

/// Connection and account settings for the carrier portal.
///
/// Supplied by the embedding application; the library never reads the
/// environment itself.
#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    /// The phone number tied to the portal login; the carrier sends the OTP
    /// here. Masked before it is echoed back in login payloads.
    pub login_phone: String,
    /// The msisdn holding the bulk allowance that transfers draw from.
    pub subscriber_msisdn: String,
    /// The sharer plan transfers are booked against.
    pub plan: String,
    /// Digits this country's msisdns are prefixed with internationally.
    pub country_code: String,
    pub timeout: Duration,
}

impl CarrierConfig {
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        login_phone: impl Into<String>,
        subscriber_msisdn: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            email: email.into(),
            password: password.into(),
            login_phone: login_phone.into(),
            subscriber_msisdn: subscriber_msisdn.into(),
            plan: "Bundle Sharer".to_owned(),
            country_code: "233".to_owned(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = plan.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_country_code(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = country_code.into();
        self
    }
}

/// The structured result of one transfer attempt.
///
/// Transfers never "throw": every path, including validation and missing
/// tokens, lands here so the caller can always persist a
/// [`crate::transfer::TransferRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub success: bool,
    pub transaction_id: String,
    pub status_code: Option<u16>,
    /// Set when the carrier rejected our credential; the queue pauses on it.
    pub requires_new_token: bool,
    /// Set for timeouts and unreachable-host failures.
    pub transient: bool,
    pub error: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl TransferOutcome {
    fn succeeded(transaction_id: String, status_code: u16, body: serde_json::Value) -> Self {
        Self {
            success: true,
            transaction_id,
            status_code: Some(status_code),
            requires_new_token: false,
            transient: false,
            error: None,
            body: Some(body),
        }
    }

    fn failed(transaction_id: String, status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id,
            status_code,
            requires_new_token: false,
            transient: false,
            error: Some(error.into()),
            body: None,
        }
    }

    fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    fn requiring_new_token(mut self) -> Self {
        self.requires_new_token = true;
        self
    }

    fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// The carrier's authoritative view of the bulk subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveBalance {
    pub msisdn: String,
    pub plan: String,
    pub total_gb: f64,
    pub remaining_gb: f64,
    pub used_gb: f64,
    pub usage_percent: u8,
    pub expires_on: Option<NaiveDate>,
}

/// The operations the queue needs from the carrier.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Performs one transfer attempt. Never fails: all outcomes, including
    /// validation and auth problems, come back as a [`TransferOutcome`].
    async fn transfer(&self, phone: &str, amount_gb: f64) -> TransferOutcome;

    /// Best-effort read of the live allowance for pool reconciliation.
    async fn fetch_live_balance(&self) -> Result<LiveBalance, CarrierError>;

    /// Validates a request before anything is enqueued or debited, returning
    /// the normalized recipient msisdn.
    fn validate(&self, phone: &str, amount_gb: f64) -> Result<String, CarrierError> {
        validate_transfer(phone, amount_gb, DEFAULT_COUNTRY_CODE)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    sms_code: &'a str,
    phone_number: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest<'a> {
    beneficiary_msisdn: &'a str,
    volume: String,
    plan: &'a str,
    transaction_id: &'a str,
    subscriber_msisdn: &'a str,
    beneficiary_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionEnvelope {
    #[serde(default)]
    data: Vec<SubscriptionEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionEntry {
    #[serde(default)]
    msisdn: String,
    #[serde(default)]
    plan: String,
    /// Remaining balance in KB, as the portal reports it.
    balance: Option<serde_json::Value>,
    /// Total plan size in GB.
    data: Option<serde_json::Value>,
    end_date: Option<String>,
}

/// HTTP client for the carrier portal.
#[derive(Clone)]
pub struct CarrierClient {
    client: reqwest::Client,
    config: CarrierConfig,
    tokens: TokenStore,
}

impl CarrierClient {
    pub fn new(config: CarrierConfig) -> Result<Self, CarrierError> {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            tokens: TokenStore::new(),
        })
    }

    /// The token store, for status displays and tests.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    // ---- auth lifecycle ----

    /// Triggers the carrier's OTP send to the configured login phone.
    pub async fn request_login_code(&self) -> Result<(), CarrierError> {
        tracing::debug!("Requesting login code");
        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, OTP_REQUEST_PATH))
            .json(&LoginRequest {
                email: &self.config.email,
                password: &self.config.password,
                sms_code: "",
                phone_number: mask_phone(&self.config.login_phone),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CarrierError::Auth(format!(
                "Login code request rejected ({status}): {body}"
            )));
        }
        self.tokens.mark_otp_requested()?;
        tracing::debug!("Login code requested");
        Ok(())
    }

    /// Exchanges the OTP for a bearer token and activates it.
    pub async fn complete_login(
        &self,
        code: &str,
        actor: Option<UserId>,
    ) -> Result<TokenStatus, CarrierError> {
        tracing::debug!("Completing login with one-time code");
        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, LOGIN_PATH))
            .json(&LoginRequest {
                email: &self.config.email,
                password: &self.config.password,
                sms_code: code,
                phone_number: mask_phone(&self.config.login_phone),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Login rejected ({status}): {body}");
            self.tokens.record_error(&message)?;
            return Err(CarrierError::Auth(message));
        }
        let body: LoginResponse = response.json().await?;
        let Some(token) = body.token else {
            let message = "No token received from login response".to_owned();
            self.tokens.record_error(&message)?;
            return Err(CarrierError::Auth(message));
        };
        let token = self.tokens.activate(token, actor)?;
        tracing::debug!(expires_at = %token.expires_at, "Login successful, token saved");
        self.tokens.status()
    }

    /// Operator-supplied token override, used when the OTP flow is
    /// unavailable. Same activation semantics as [`Self::complete_login`].
    pub fn set_manual_token(
        &self,
        raw_token: impl Into<String>,
        actor: Option<UserId>,
    ) -> Result<TokenStatus, CarrierError> {
        let token = self.tokens.activate(raw_token, actor)?;
        tracing::debug!(expires_at = %token.expires_at, "Manual token saved");
        self.tokens.status()
    }

    pub fn token_status(&self) -> Result<TokenStatus, CarrierError> {
        self.tokens.status()
    }

    pub fn token_history(&self) -> Result<Vec<TokenSummary>, CarrierError> {
        self.tokens.history(20)
    }

    /// The bearer token to attach to a call: the active token, or as a last
    /// resort the most recent stored token, which may be stale.
    fn auth_token(&self) -> Result<String, CarrierError> {
        if let Some(token) = self.tokens.active()? {
            let remaining = token.expires_at - Utc::now();
            if remaining < TimeDelta::hours(2) {
                tracing::warn!(expires_at = %token.expires_at, "Token expiring soon");
            }
            return Ok(token.token);
        }
        if let Some(token) = self.tokens.latest()? {
            tracing::warn!("No valid token, using most recent stored token");
            return Ok(token.token);
        }
        Err(CarrierError::Auth(
            "Authentication token not available. Generate a new token via settings.".to_owned(),
        ))
    }
}

#[async_trait]
impl Carrier for CarrierClient {
    async fn transfer(&self, phone: &str, amount_gb: f64) -> TransferOutcome {
        let transaction_id = generate_transaction_id();

        let formatted = match validate_transfer(phone, amount_gb, &self.config.country_code) {
            Ok(formatted) => formatted,
            Err(CarrierError::Validation(message)) => {
                return TransferOutcome::failed(transaction_id, Some(400), message);
            }
            Err(error) => {
                return TransferOutcome::failed(transaction_id, None, error.to_string());
            }
        };

        let token = match self.auth_token() {
            Ok(token) => token,
            Err(error) => {
                return TransferOutcome::failed(transaction_id, Some(401), error.to_string())
                    .requiring_new_token();
            }
        };

        tracing::debug!(
            %transaction_id,
            recipient = %formatted,
            amount_gb,
            plan = %self.config.plan,
            "Sending bundle"
        );

        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, TRANSFER_PATH))
            .bearer_auth(&token)
            .json(&TransferRequest {
                beneficiary_msisdn: &formatted,
                volume: amount_gb.to_string(),
                plan: &self.config.plan,
                transaction_id: &transaction_id,
                subscriber_msisdn: &self.config.subscriber_msisdn,
                beneficiary_name: &formatted,
            })
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                return TransferOutcome::failed(
                    transaction_id,
                    Some(408),
                    "Request timeout - carrier API not responding",
                )
                .transient();
            }
            Err(error) if error.is_connect() => {
                return TransferOutcome::failed(
                    transaction_id,
                    Some(503),
                    "Cannot reach carrier API",
                )
                .transient();
            }
            Err(error) => {
                return TransferOutcome::failed(transaction_id, None, error.to_string())
                    .transient();
            }
        };

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            if body_signals_failure(&body) {
                tracing::debug!(%status, "Carrier returned success status but failure body");
                let message = failure_message(&body)
                    .unwrap_or_else(|| "Order failed despite success response".to_owned());
                return TransferOutcome::failed(transaction_id, Some(status.as_u16()), message)
                    .with_body(body);
            }
            tracing::debug!(%transaction_id, "Bundle sent successfully");
            return TransferOutcome::succeeded(transaction_id, status.as_u16(), body);
        }

        if status == StatusCode::UNAUTHORIZED {
            if let Err(error) = self.tokens.deactivate_active("Token rejected by carrier - 401") {
                tracing::error!(?error, "Failed to deactivate rejected token");
            }
            return TransferOutcome::failed(
                transaction_id,
                Some(401),
                "Token expired. Refresh token in settings.",
            )
            .requiring_new_token();
        }

        tracing::debug!(%status, ?body, "Carrier API error");
        let message =
            failure_message(&body).unwrap_or_else(|| format!("Request failed ({status})"));
        TransferOutcome::failed(transaction_id, Some(status.as_u16()), message).with_body(body)
    }

    async fn fetch_live_balance(&self) -> Result<LiveBalance, CarrierError> {
        let token = self.auth_token()?;
        let phone = localize_msisdn(&self.config.subscriber_msisdn, &self.config.country_code);

        let response = self
            .client
            .get(format!(
                "{}{}/{}",
                self.config.base_url, SUBSCRIPTIONS_PATH, phone
            ))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?;

        let envelope: SubscriptionEnvelope = response.json().await?;
        let entry = envelope.data.into_iter().next().ok_or_else(|| {
            CarrierError::Validation("No active subscription found at carrier".to_owned())
        })?;

        let balance_kb = entry.balance.as_ref().map(value_to_f64).unwrap_or(0.0);
        let remaining_gb = round2(balance_kb / 1_048_576.0);
        let total_gb = entry.data.as_ref().map(value_to_f64).unwrap_or(0.0);
        let used_gb = round2(total_gb - remaining_gb);
        let usage_percent = if total_gb > 0.0 {
            ((used_gb / total_gb) * 100.0).round() as u8
        } else {
            0
        };

        Ok(LiveBalance {
            msisdn: entry.msisdn,
            plan: entry.plan,
            total_gb,
            remaining_gb,
            used_gb,
            usage_percent,
            expires_on: entry
                .end_date
                .and_then(|date| NaiveDate::parse_from_str(&date, "%Y%m%d").ok()),
        })
    }

    fn validate(&self, phone: &str, amount_gb: f64) -> Result<String, CarrierError> {
        validate_transfer(phone, amount_gb, &self.config.country_code)
    }
}

/// Generates a transaction id in the portal's expected shape: a fixed prefix,
/// a random block, and a millisecond timestamp.
pub fn generate_transaction_id() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|byte| (byte as char).to_ascii_uppercase())
        .collect();
    format!("TXN{random}{}", Utc::now().timestamp_millis())
}

/// Validates and normalizes a transfer request, returning the localized
/// recipient msisdn. Runs before any network call.
pub fn validate_transfer(
    phone: &str,
    amount_gb: f64,
    country_code: &str,
) -> Result<String, CarrierError> {
    let mut errors = Vec::new();
    let formatted = match format_phone(phone, country_code) {
        Ok(formatted) => Some(formatted),
        Err(CarrierError::Validation(message)) => {
            errors.push(message);
            None
        }
        Err(error) => return Err(error),
    };
    if !amount_gb.is_finite() || amount_gb <= 0.0 {
        errors.push("Amount must be greater than 0".to_owned());
    }
    if amount_gb > MAX_TRANSFER_GB {
        errors.push(format!("Amount exceeds maximum limit of {MAX_TRANSFER_GB}GB"));
    }
    match formatted {
        Some(formatted) if errors.is_empty() => Ok(formatted),
        _ => Err(CarrierError::Validation(errors.join(", "))),
    }
}

/// Normalizes a phone number to the carrier's local format: digits only,
/// international prefix replaced by a leading zero.
fn format_phone(phone: &str, country_code: &str) -> Result<String, CarrierError> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    let localized = localize_digits(&digits, country_code);
    let valid = localized.len() == 10
        && localized.starts_with('0')
        && localized[1..2].chars().all(|c| ('2'..='9').contains(&c));
    if valid {
        Ok(localized)
    } else {
        Err(CarrierError::Validation(format!(
            "Invalid phone number format: {phone}"
        )))
    }
}

fn localize_msisdn(msisdn: &str, country_code: &str) -> String {
    let digits: String = msisdn.chars().filter(char::is_ascii_digit).collect();
    localize_digits(&digits, country_code)
}

fn localize_digits(digits: &str, country_code: &str) -> String {
    if let Some(rest) = digits.strip_prefix(country_code) {
        format!("0{rest}")
    } else if !digits.starts_with('0') {
        format!("0{digits}")
    } else {
        digits.to_owned()
    }
}

/// Masks the middle digits of a local phone number before echoing it to the
/// carrier's login endpoint.
fn mask_phone(phone: &str) -> String {
    if phone.starts_with('0') && phone.len() >= 10 {
        format!("{}******{}", &phone[..3], &phone[9..])
    } else {
        phone.to_owned()
    }
}

/// The carrier sometimes reports failure inside a 2xx response; detect its
/// error envelope.
fn body_signals_failure(body: &serde_json::Value) -> bool {
    body.get("success").and_then(|v| v.as_bool()) == Some(false)
        || body.get("error").is_some_and(|v| !v.is_null())
        || matches!(
            body.get("status").and_then(|v| v.as_str()),
            Some("failed") | Some("error")
        )
}

fn failure_message(body: &serde_json::Value) -> Option<String> {
    for key in ["message", "error", "errors"] {
        match body.get(key) {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::String(message)) => return Some(message.clone()),
            Some(value) => return Some(value.to_string()),
        }
    }
    None
}

fn value_to_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::Number(number) => number.as_f64().unwrap_or(0.0),
        serde_json::Value::String(text) => text.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
