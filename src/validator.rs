//! Signal Validator
//!
//! Gates every signal before money moves. Checks run in a fixed order and the
//! first failure wins; a rejected signal is discarded for that tick only and
//! the tenant stays enabled.

use rust_decimal::Decimal;

use crate::config::ValidationConfig;
use crate::domain::{MarketSnapshot, Portfolio, Side, StrategySignal};
use crate::error::ValidationError;

pub struct SignalValidator {
    config: ValidationConfig,
}

impl SignalValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate one signal against portfolio rules and the tick's snapshot.
    pub fn validate(
        &self,
        signal: &StrategySignal,
        portfolio: &Portfolio,
        snapshot: &MarketSnapshot,
    ) -> Result<(), ValidationError> {
        self.check_universe(signal, snapshot)?;
        self.check_quantity(signal)?;
        self.check_price(signal)?;
        self.check_price_band(signal, snapshot)?;
        self.check_funding(signal, portfolio)?;
        Ok(())
    }

    fn check_universe(
        &self,
        signal: &StrategySignal,
        snapshot: &MarketSnapshot,
    ) -> Result<(), ValidationError> {
        let known = if self.config.universe.is_empty() {
            snapshot.prices.contains_key(&signal.symbol)
        } else {
            self.config.universe.iter().any(|s| s == &signal.symbol)
        };
        if !known {
            return Err(ValidationError::UnknownSymbol(signal.symbol.clone()));
        }
        Ok(())
    }

    fn check_quantity(&self, signal: &StrategySignal) -> Result<(), ValidationError> {
        if signal.quantity <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveQuantity(signal.quantity));
        }
        Ok(())
    }

    fn check_price(&self, signal: &StrategySignal) -> Result<(), ValidationError> {
        if signal.price <= Decimal::ZERO {
            return Err(ValidationError::NonPositivePrice(signal.price));
        }
        Ok(())
    }

    /// Reject prices far off the last known price; fat-fingered or stale
    /// signals must not move the book. Symbols without a quote this tick skip
    /// the band check (there is nothing to compare against).
    fn check_price_band(
        &self,
        signal: &StrategySignal,
        snapshot: &MarketSnapshot,
    ) -> Result<(), ValidationError> {
        let Some(last) = snapshot.price(&signal.symbol) else {
            return Ok(());
        };
        if last <= Decimal::ZERO {
            return Ok(());
        }
        let deviation = ((signal.price - last) / last).abs();
        if deviation > self.config.price_band_pct {
            return Err(ValidationError::PriceOutOfBand {
                symbol: signal.symbol.clone(),
                price: signal.price,
                last,
                band_pct: self.config.price_band_pct * Decimal::from(100),
            });
        }
        Ok(())
    }

    fn check_funding(
        &self,
        signal: &StrategySignal,
        portfolio: &Portfolio,
    ) -> Result<(), ValidationError> {
        match signal.action {
            Side::Buy => {
                let needed = signal.quantity * signal.price;
                let available = portfolio.available_cash();
                if needed > available {
                    return Err(ValidationError::InsufficientCash { needed, available });
                }
            }
            Side::Sell => {
                let sellable = portfolio.sellable(&signal.symbol);
                if signal.quantity > sellable && !self.config.allow_short {
                    if sellable.is_zero() {
                        return Err(ValidationError::ShortingDisabled {
                            symbol: signal.symbol.clone(),
                        });
                    }
                    return Err(ValidationError::InsufficientPosition {
                        symbol: signal.symbol.clone(),
                        requested: signal.quantity,
                        sellable,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MinuteBar;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snapshot(price: Decimal) -> MarketSnapshot {
        MarketSnapshot::from_bars(
            Utc::now(),
            vec![MinuteBar {
                symbol: "AAPL".to_string(),
                timestamp: Utc::now(),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 100,
            }],
        )
    }

    fn validator() -> SignalValidator {
        SignalValidator::new(ValidationConfig::default())
    }

    fn buy(quantity: Decimal, price: Decimal) -> StrategySignal {
        StrategySignal::market("AAPL", Side::Buy, quantity, price)
    }

    #[test]
    fn accepts_a_sane_buy() {
        let portfolio = Portfolio::new(dec!(10000));
        let result = validator().validate(&buy(dec!(10), dec!(150)), &portfolio, &snapshot(dec!(150)));
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_unknown_symbol_first() {
        let portfolio = Portfolio::new(dec!(10000));
        // Quantity is also bad, but the universe rule runs first
        let signal = StrategySignal::market("ZZZZ", Side::Buy, dec!(0), dec!(150));
        let err = validator()
            .validate(&signal, &portfolio, &snapshot(dec!(150)))
            .expect_err("unknown symbol must fail");
        assert_eq!(err.rule(), "symbol_universe");
    }

    #[test]
    fn configured_universe_overrides_snapshot() {
        let mut config = ValidationConfig::default();
        config.universe = vec!["MSFT".to_string()];
        let validator = SignalValidator::new(config);
        let portfolio = Portfolio::new(dec!(10000));

        let err = validator
            .validate(&buy(dec!(1), dec!(150)), &portfolio, &snapshot(dec!(150)))
            .expect_err("AAPL is outside the configured universe");
        assert_eq!(err.rule(), "symbol_universe");
    }

    #[test]
    fn rejects_non_positive_quantity_and_price() {
        let portfolio = Portfolio::new(dec!(10000));
        let err = validator()
            .validate(&buy(dec!(0), dec!(150)), &portfolio, &snapshot(dec!(150)))
            .expect_err("zero quantity must fail");
        assert_eq!(err.rule(), "quantity_positive");

        let err = validator()
            .validate(&buy(dec!(1), dec!(-5)), &portfolio, &snapshot(dec!(150)))
            .expect_err("negative price must fail");
        assert_eq!(err.rule(), "price_positive");
    }

    #[test]
    fn rejects_price_outside_band() {
        let portfolio = Portfolio::new(dec!(100000));
        // Last known price 150, band 10% -> 170 is an outlier
        let err = validator()
            .validate(&buy(dec!(1), dec!(170)), &portfolio, &snapshot(dec!(150)))
            .expect_err("outlier price must fail");
        assert_eq!(err.rule(), "price_band");

        // 160 is within 10%
        assert!(validator()
            .validate(&buy(dec!(1), dec!(160)), &portfolio, &snapshot(dec!(150)))
            .is_ok());
    }

    #[test]
    fn buy_capped_by_available_cash_including_reservations() {
        let mut portfolio = Portfolio::new(dec!(2000));
        portfolio
            .reserve("AAPL", Side::Buy, dec!(10), dec!(150))
            .expect("reserve succeeds");

        // 2000 - 1500 reserved leaves 500 available
        let err = validator()
            .validate(&buy(dec!(4), dec!(150)), &portfolio, &snapshot(dec!(150)))
            .expect_err("buy beyond available cash must fail");
        assert_eq!(err.rule(), "buying_power");
    }

    #[test]
    fn sell_rules_distinguish_shorting_from_oversell() {
        let mut portfolio = Portfolio::new(dec!(10000));
        let sell = |quantity| StrategySignal::market("AAPL", Side::Sell, quantity, dec!(150));

        let err = validator()
            .validate(&sell(dec!(1)), &portfolio, &snapshot(dec!(150)))
            .expect_err("naked short must fail");
        assert_eq!(err.rule(), "no_shorting");

        portfolio
            .apply_fill("AAPL", Side::Buy, dec!(5), dec!(150), false)
            .expect("buy applies");
        let err = validator()
            .validate(&sell(dec!(9)), &portfolio, &snapshot(dec!(150)))
            .expect_err("oversell must fail");
        assert_eq!(err.rule(), "position_cap");

        assert!(validator()
            .validate(&sell(dec!(5)), &portfolio, &snapshot(dec!(150)))
            .is_ok());
    }

    #[test]
    fn shorting_allowed_when_enabled() {
        let mut config = ValidationConfig::default();
        config.allow_short = true;
        let validator = SignalValidator::new(config);
        let portfolio = Portfolio::new(dec!(10000));

        let signal = StrategySignal::market("AAPL", Side::Sell, dec!(3), dec!(150));
        assert!(validator
            .validate(&signal, &portfolio, &snapshot(dec!(150)))
            .is_ok());
    }
}
