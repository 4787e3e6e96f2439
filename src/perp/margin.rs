//! Margin arithmetic for leveraged positions.
//!
//! The liquidation price is a single-factor approximation: it ignores fees
//! and funding and only accounts for the initial margin fraction
//! (`1 / leverage`) and the maintenance margin ratio.

use rust_decimal::Decimal;

use super::PositionSide;

/// `None` when the product leaves the representable range.
pub fn notional(amount: Decimal, price: Decimal) -> Option<Decimal> {
    amount.checked_mul(price)
}

pub fn initial_margin(notional: Decimal, leverage: u32) -> Decimal {
    notional / Decimal::from(leverage.max(1))
}

/// long:  `max(0, entry * (1 - 1/leverage + maintenance))`
/// short: `max(0, entry * (1 + 1/leverage - maintenance))`
pub fn liquidation_price(
    side: PositionSide,
    entry_price: Decimal,
    leverage: u32,
    maintenance: Decimal,
) -> Option<Decimal> {
    let imf = Decimal::ONE / Decimal::from(leverage.max(1));
    let factor = match side {
        PositionSide::Long => Decimal::ONE - imf + maintenance,
        PositionSide::Short => Decimal::ONE + imf - maintenance,
    };
    entry_price
        .checked_mul(factor)
        .map(|price| price.max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_liquidation_price_long() {
        assert_eq!(
            liquidation_price(PositionSide::Long, dec!(100), 10, dec!(0.005)),
            Some(dec!(90.5))
        );
    }

    #[test]
    fn test_liquidation_price_short() {
        assert_eq!(
            liquidation_price(PositionSide::Short, dec!(100), 10, dec!(0.005)),
            Some(dec!(109.5))
        );
    }

    #[test]
    fn test_liquidation_price_one_x_long_is_near_zero() {
        // 1x long only liquidates at maintenance margin of entry
        assert_eq!(
            liquidation_price(PositionSide::Long, dec!(100), 1, dec!(0.005)),
            Some(dec!(0.5))
        );
        assert_eq!(
            liquidation_price(PositionSide::Long, dec!(100), 1, dec!(0)),
            Some(dec!(0))
        );
    }

    #[test]
    fn test_margin() {
        let n = notional(dec!(0.5), dec!(60000)).unwrap();
        assert_eq!(n, dec!(30000));
        assert_eq!(initial_margin(n, 20), dec!(1500));
    }

    #[test]
    fn test_out_of_range_is_none() {
        assert_eq!(notional(Decimal::MAX, dec!(2)), None);
        assert_eq!(
            liquidation_price(PositionSide::Short, Decimal::MAX, 10, dec!(0.005)),
            None
        );
    }
}
