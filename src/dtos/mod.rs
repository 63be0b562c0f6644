//! Request/response shapes for the HTTP surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::{
    AuthOutcome, PaymentMethod, PaymentProvider, PaymentTransaction, RiskTier, TransactionStatus,
    TransactionType,
};

fn validate_positive_amount(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter uppercase ISO 4217 code".into());
        Err(err)
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct CreatePaymentRequest {
    #[validate(length(min = 1, max = 100))]
    pub idempotency_key: Option<String>,
    #[validate(custom(function = "validate_positive_amount"))]
    pub amount: Decimal,
    #[validate(custom(function = "validate_currency"))]
    pub currency: String,
    pub provider: PaymentProvider,
    pub method: PaymentMethod,
    #[serde(default = "default_transaction_type")]
    pub transaction_type: TransactionType,
    pub subscription_id: Option<Uuid>,
    #[validate(length(max = 500))]
    pub description: Option<String>,
    #[serde(default)]
    pub billing: Option<BillingInfo>,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
}

fn default_transaction_type() -> TransactionType {
    TransactionType::Payment
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BillingInfo {
    pub country: Option<String>,
    pub card_country: Option<String>,
    pub card_last_four: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DeviceInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CaptureRequest {
    /// Defaults to the full authorized amount.
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(custom(function = "validate_positive_amount"))]
    pub amount: Decimal,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepUpOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct StepUpRequest {
    pub outcome: StepUpOutcome,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTransactionsQuery {
    pub user: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub caller_id: String,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: String,
    pub original_amount: Option<Decimal>,
    pub original_currency: Option<String>,
    pub exchange_rate: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub captured_amount: Option<Decimal>,
    pub refunded_amount: Decimal,
    pub provider: PaymentProvider,
    pub method: PaymentMethod,
    pub transaction_type: TransactionType,
    pub provider_transaction_id: Option<String>,
    pub provider_response_code: Option<String>,
    pub provider_response_message: Option<String>,
    pub fraud_score: Decimal,
    pub risk_tier: RiskTier,
    pub authentication_outcome: AuthOutcome,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub parent_transaction_id: Option<Uuid>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentTransaction> for TransactionResponse {
    fn from(txn: PaymentTransaction) -> Self {
        Self {
            id: txn.id,
            caller_id: txn.caller_id,
            status: txn.status,
            amount: txn.amount,
            currency: txn.currency,
            original_amount: txn.original_amount,
            original_currency: txn.original_currency,
            exchange_rate: txn.exchange_rate,
            fee_amount: txn.fee_amount,
            captured_amount: txn.captured_amount,
            refunded_amount: txn.refunded_amount,
            provider: txn.provider,
            method: txn.method,
            transaction_type: txn.transaction_type,
            provider_transaction_id: txn.provider_transaction_id,
            provider_response_code: txn.provider_response_code,
            provider_response_message: txn.provider_response_message,
            fraud_score: txn.fraud_score,
            risk_tier: txn.risk_tier,
            authentication_outcome: txn.authentication_outcome,
            attempt_count: txn.attempt_count,
            next_retry_at: txn.next_retry_at,
            parent_transaction_id: txn.parent_transaction_id,
            version: txn.version,
            created_at: txn.created_at,
            updated_at: txn.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    pub transactions: Vec<TransactionResponse>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
}
