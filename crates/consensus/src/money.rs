//! Monetary units of the native chain.

/// Atomic units; one coin is `COIN` atomic units.
pub type Amount = u64;

pub const COIN: Amount = 1_000_000_000;

/// Converts a coin quantity into atomic units, rounding to the nearest unit.
pub fn coins(value: f64) -> Amount {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value * COIN as f64).round() as Amount
}

/// Renders atomic units as a decimal coin amount with nine fractional digits.
pub fn format_coins(amount: Amount) -> String {
    format!("{}.{:09}", amount / COIN, amount % COIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coins_round_to_atomic_units() {
        assert_eq!(coins(1.0), COIN);
        assert_eq!(coins(18.9), 18_900_000_000);
        assert_eq!(coins(0.000_000_000_4), 0);
        assert_eq!(coins(-3.0), 0);
        assert_eq!(coins(f64::NAN), 0);
    }

    #[test]
    fn format_keeps_nine_decimals() {
        assert_eq!(format_coins(0), "0.000000000");
        assert_eq!(format_coins(coins(150.0)), "150.000000000");
        assert_eq!(format_coins(1_234_567_890_123), "1234.567890123");
    }
}
