//! Core domain types for the payment engine.
//!
//! `PaymentTransaction` is the authoritative record for every payment,
//! capture, cancellation and refund. All monetary values are fixed-point
//! [`Decimal`]s; floats never touch money.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle states of a payment transaction.
///
/// Transitions are only accepted along the edges encoded in
/// [`TransactionStatus::can_transition_to`]; everything else is rejected
/// and recorded as a discarded event.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Created,
    Pending,
    Authorized,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
    RefundRequested,
    Refunded,
}

impl TransactionStatus {
    /// Terminal states: monetary fields are immutable once reached.
    ///
    /// `Succeeded` is terminal for payment purposes but still admits the
    /// refund sub-path (`Succeeded -> RefundRequested -> Refunded`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired | Self::Refunded
        )
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            // Fraud rejection and caller aborts happen before submission.
            (Created, Pending) | (Created, Failed) | (Created, Cancelled) => true,
            (Pending, Authorized) | (Pending, Succeeded) | (Pending, Failed) => true,
            (Pending, Expired) | (Pending, Cancelled) => true,
            (Authorized, Succeeded) | (Authorized, Cancelled) => true,
            (Authorized, Expired) | (Authorized, Failed) => true,
            // Refund sub-path; a partial or declined refund returns the
            // parent to Succeeded with its refunded balance updated.
            (Succeeded, RefundRequested) => true,
            (RefundRequested, Refunded) | (RefundRequested, Succeeded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::RefundRequested => "REFUND_REQUESTED",
            Self::Refunded => "REFUNDED",
        };
        f.write_str(s)
    }
}

/// External payment providers the engine can route to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    Paypal,
    Iyzico,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Paypal => "paypal",
            Self::Iyzico => "iyzico",
        }
    }

    pub const ALL: [PaymentProvider; 3] = [Self::Stripe, Self::Paypal, Self::Iyzico];
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::Paypal),
            "iyzico" => Ok(Self::Iyzico),
            other => Err(format!("unknown payment provider: {other}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    DigitalWallet,
    MobilePayment,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
            Self::DigitalWallet => "digital_wallet",
            Self::MobilePayment => "mobile_payment",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    SubscriptionCharge,
    Refund,
    Capture,
    Cancellation,
}

/// Risk tier assigned by the fraud gate at decision time.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// Outcome of step-up authentication (3-D-Secure style challenge).
///
/// A pending challenge is carried here rather than as a top-level status.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    NotRequired,
    Pending,
    Passed,
    Failed,
}

/// The authoritative payment transaction record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub caller_id: String,
    pub idempotency_key: Option<String>,
    pub subscription_id: Option<Uuid>,

    /// Settlement amount, always > 0.
    pub amount: Decimal,
    /// Settlement currency (ISO 4217).
    pub currency: String,
    pub original_amount: Option<Decimal>,
    pub original_currency: Option<String>,
    pub exchange_rate: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    /// Amount actually settled; on a partial capture this is less than
    /// the authorized `amount` and bounds the refundable balance.
    pub captured_amount: Option<Decimal>,
    /// Sum of refunds applied against this transaction so far.
    pub refunded_amount: Decimal,

    pub provider: PaymentProvider,
    pub method: PaymentMethod,
    pub transaction_type: TransactionType,
    pub description: Option<String>,

    /// Set exactly once, when the provider first acknowledges the charge.
    pub provider_transaction_id: Option<String>,
    pub provider_response_code: Option<String>,
    pub provider_response_message: Option<String>,

    pub status: TransactionStatus,

    // Risk snapshot, captured at decision time and never recomputed.
    pub fraud_score: Decimal,
    pub risk_tier: RiskTier,
    pub authentication_outcome: AuthOutcome,

    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Reservation held while a capture call is in flight at the
    /// provider; set and cleared through the ledger's CAS path.
    pub capture_in_flight: bool,
    pub last_gateway: Option<String>,
    pub processing_ms: Option<u64>,
    pub manual_review: bool,

    /// Refunds reference the transaction they refund.
    pub parent_transaction_id: Option<Uuid>,
    pub refund_reason: Option<String>,

    /// Optimistic concurrency token; +1 per accepted mutation.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    /// Amount still eligible to be refunded, bounded by what was
    /// actually captured rather than what was authorized.
    pub fn remaining_refundable(&self) -> Decimal {
        self.captured_amount.unwrap_or(self.amount) - self.refunded_amount
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Where a transition request originated; part of the audit trail so
/// reconciliation-driven corrections are distinguishable from webhooks.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    #[default]
    Api,
    Provider,
    Webhook,
    Retry,
    Reconciliation,
}

impl fmt::Display for TransitionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Api => "api",
            Self::Provider => "provider",
            Self::Webhook => "webhook",
            Self::Retry => "retry",
            Self::Reconciliation => "reconciliation",
        };
        f.write_str(s)
    }
}

/// Append-only record of every attempted transition, accepted or not.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub from: Option<TransactionStatus>,
    pub to: TransactionStatus,
    pub source: TransitionSource,
    pub accepted: bool,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Emitted on every terminal transition for notification/reporting
/// consumers. Delivery is at-least-once; consumers dedupe on
/// (transaction_id, status).
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct PaymentEvent {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub reason: Option<String>,
}

/// Aggregate payment statistics for one caller.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct UserPaymentStats {
    pub total_count: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub total_succeeded_amount: Decimal,
    pub total_refunded_amount: Decimal,
}
