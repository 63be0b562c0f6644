//! Processing fee and currency conversion calculators.
//!
//! Both are pure functions of their inputs and hold no state beyond their
//! rate tables. Real market rate sourcing is out of scope; the FX table is
//! a fixed snapshot supplied at construction.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use crate::error::EngineError;
use crate::models::{PaymentMethod, PaymentProvider};

pub struct FeeCalculator;

impl FeeCalculator {
    /// Processing fee for a charge: provider percentage plus fixed
    /// component, scaled by a per-method multiplier, rounded to 2 dp.
    pub fn processing_fee(
        amount: Decimal,
        provider: PaymentProvider,
        method: PaymentMethod,
    ) -> Decimal {
        let (percentage, fixed) = match provider {
            PaymentProvider::Stripe => (dec!(0.029), dec!(0.30)),
            PaymentProvider::Paypal => (dec!(0.034), dec!(0.35)),
            PaymentProvider::Iyzico => (dec!(0.025), dec!(0.25)),
        };
        let method_multiplier = match method {
            PaymentMethod::Card => dec!(1.0),
            PaymentMethod::BankTransfer => dec!(0.5),
            PaymentMethod::DigitalWallet => dec!(1.1),
            PaymentMethod::MobilePayment => dec!(1.2),
        };
        (amount * percentage * method_multiplier + fixed).round_dp(2)
    }
}

/// Result of converting an amount into a provider's settlement currency.
#[derive(Debug, Clone, PartialEq)]
pub struct FxConversion {
    pub amount: Decimal,
    pub rate: Decimal,
}

pub struct FxConverter {
    rates: HashMap<(String, String), Decimal>,
}

impl FxConverter {
    /// Fixed snapshot of conversion rates between the supported
    /// settlement currencies.
    pub fn with_default_rates() -> Self {
        let mut rates = HashMap::new();
        let table = [
            ("USD", "EUR", dec!(0.92)),
            ("EUR", "USD", dec!(1.09)),
            ("USD", "GBP", dec!(0.79)),
            ("GBP", "USD", dec!(1.27)),
            ("USD", "TRY", dec!(34.10)),
            ("TRY", "USD", dec!(0.029)),
            ("EUR", "GBP", dec!(0.86)),
            ("GBP", "EUR", dec!(1.16)),
            ("EUR", "TRY", dec!(37.20)),
            ("TRY", "EUR", dec!(0.027)),
            ("GBP", "TRY", dec!(43.30)),
            ("TRY", "GBP", dec!(0.023)),
        ];
        for (from, to, rate) in table {
            rates.insert((from.to_string(), to.to_string()), rate);
        }
        Self { rates }
    }

    pub fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<FxConversion, EngineError> {
        if from == to {
            return Ok(FxConversion {
                amount,
                rate: Decimal::ONE,
            });
        }
        let rate = self
            .rates
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .ok_or_else(|| {
                EngineError::InvalidRequest(anyhow::anyhow!(
                    "unsupported currency conversion {from} -> {to}"
                ))
            })?;
        Ok(FxConversion {
            amount: (amount * rate).round_dp(2),
            rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_fee_includes_fixed_component() {
        let fee = FeeCalculator::processing_fee(
            dec!(100.00),
            PaymentProvider::Stripe,
            PaymentMethod::Card,
        );
        assert_eq!(fee, dec!(3.20)); // 2.9% + 0.30
    }

    #[test]
    fn bank_transfer_halves_percentage() {
        let fee = FeeCalculator::processing_fee(
            dec!(100.00),
            PaymentProvider::Stripe,
            PaymentMethod::BankTransfer,
        );
        assert_eq!(fee, dec!(1.75)); // 1.45% + 0.30
    }

    #[test]
    fn same_currency_is_identity() {
        let fx = FxConverter::with_default_rates();
        let conv = fx.convert(dec!(50.00), "USD", "USD").unwrap();
        assert_eq!(conv.amount, dec!(50.00));
        assert_eq!(conv.rate, Decimal::ONE);
    }

    #[test]
    fn converts_with_table_rate() {
        let fx = FxConverter::with_default_rates();
        let conv = fx.convert(dec!(100.00), "USD", "EUR").unwrap();
        assert_eq!(conv.amount, dec!(92.00));
        assert_eq!(conv.rate, dec!(0.92));
    }

    #[test]
    fn unsupported_pair_is_rejected() {
        let fx = FxConverter::with_default_rates();
        assert!(fx.convert(dec!(10.00), "USD", "JPY").is_err());
    }
}
