//! Fraud risk gate.
//!
//! A pure scoring function over device/billing signals. The decision is
//! snapshotted onto the transaction at creation and never recomputed.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::FraudConfig;
use crate::dtos::{BillingInfo, DeviceInfo};
use crate::models::RiskTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FraudDecision {
    Accept,
    /// Step-up authentication required before submission.
    Challenge,
    /// Short-circuits the pipeline before any provider call.
    Reject,
}

#[derive(Debug, Clone)]
pub struct FraudAssessment {
    pub score: Decimal,
    pub tier: RiskTier,
    pub decision: FraudDecision,
}

pub struct FraudGate {
    config: FraudConfig,
}

impl FraudGate {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    pub fn assess(
        &self,
        amount: Decimal,
        billing: Option<&BillingInfo>,
        device: Option<&DeviceInfo>,
    ) -> FraudAssessment {
        let mut score = Decimal::ZERO;

        match device {
            Some(d) => {
                if d.fingerprint.is_none() {
                    score += dec!(30);
                }
                if d.ip_address.is_none() {
                    score += dec!(20);
                }
            }
            None => score += dec!(50),
        }

        match billing {
            Some(b) => {
                if b.country.is_none() {
                    score += dec!(10);
                }
                if let (Some(billing_country), Some(card_country)) =
                    (b.country.as_deref(), b.card_country.as_deref())
                {
                    if billing_country != card_country {
                        score += dec!(15);
                    }
                }
            }
            None => score += dec!(10),
        }

        if amount >= self.config.high_value_amount {
            score += dec!(25);
        }

        let score = score.min(dec!(100));

        let decision = if score >= self.config.reject_threshold {
            FraudDecision::Reject
        } else if score >= self.config.challenge_threshold {
            FraudDecision::Challenge
        } else {
            FraudDecision::Accept
        };

        let tier = if score >= self.config.reject_threshold {
            RiskTier::High
        } else if score >= self.config.challenge_threshold {
            RiskTier::Medium
        } else {
            RiskTier::Low
        };

        FraudAssessment {
            score,
            tier,
            decision,
        }
    }
}
