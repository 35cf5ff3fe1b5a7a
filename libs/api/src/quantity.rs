//! Resource quantities in the control plane's native syntax.
//!
//! A quantity is a decimal number followed by an optional suffix:
//!
//! - binary SI: `Ki`, `Mi`, `Gi`, `Ti`, `Pi`, `Ei`
//! - decimal SI: `n`, `u`, `m`, (none), `k`, `M`, `G`, `T`, `P`, `E`
//! - decimal exponent: `e3`, `E-2`, ...
//!
//! Quantities compare by the amount they denote, so `0.1` equals `100m` and
//! `1Ki` equals `1024`. The original spelling is kept for display and
//! serialization.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ApiError;

/// Amounts are stored in billionths of a unit.
const NANO_EXPONENT: i32 = 9;

/// A parsed resource quantity.
#[derive(Debug, Clone)]
pub struct Quantity {
    raw: String,
    nanos: i128,
}

enum Scale {
    Decimal(i32),
    Binary(u32),
}

impl Quantity {
    /// Parse a quantity string.
    pub fn parse(s: &str) -> Result<Self, ApiError> {
        if s.is_empty() {
            return Err(ApiError::EmptyQuantity);
        }
        let invalid = |reason| ApiError::InvalidQuantity {
            value: s.to_string(),
            reason,
        };

        let (negative, unsigned) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let split = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("missing number"));
        }
        if frac_part.contains('.') {
            return Err(invalid("more than one decimal point"));
        }

        let mut mantissa: i128 = 0;
        for digit in int_part.bytes().chain(frac_part.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit - b'0')))
                .ok_or_else(|| invalid("number out of range"))?;
        }
        let frac_len =
            i32::try_from(frac_part.len()).map_err(|_| invalid("number out of range"))?;

        let scale = parse_suffix(suffix).ok_or_else(|| invalid("unknown suffix"))?;
        let base = NANO_EXPONENT
            .checked_sub(frac_len)
            .ok_or_else(|| invalid("number out of range"))?;

        let nanos = match scale {
            Scale::Decimal(exp) => base
                .checked_add(exp)
                .and_then(|exp| shift_decimal(mantissa, exp)),
            Scale::Binary(bits) => 1i128
                .checked_shl(bits)
                .and_then(|factor| mantissa.checked_mul(factor))
                .and_then(|m| shift_decimal(m, base)),
        }
        .ok_or_else(|| invalid("number out of range"))?;

        Ok(Self {
            raw: s.to_string(),
            nanos: if negative { -nanos } else { nanos },
        })
    }

    /// The amount in billionths of a unit.
    pub fn as_nanos(&self) -> i128 {
        self.nanos
    }

    /// The quantity as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            if exponent.is_empty() || exponent == "-" || exponent == "+" {
                return None;
            }
            Scale::Decimal(exponent.parse().ok()?)
        }
    };
    Some(scale)
}

/// Multiply by `10^exp`, rounding sub-nano remainders up.
fn shift_decimal(value: i128, exp: i32) -> Option<i128> {
    if exp >= 0 {
        10i128
            .checked_pow(exp.unsigned_abs())
            .and_then(|factor| value.checked_mul(factor))
    } else {
        match 10i128.checked_pow(exp.unsigned_abs()) {
            Some(divisor) => {
                let quotient = value / divisor;
                Some(if value % divisor == 0 { quotient } else { quotient + 1 })
            }
            // Anything that small rounds up to the smallest representable amount.
            None => Some(if value == 0 { 0 } else { 1 }),
        }
    }
}

impl FromStr for Quantity {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl Hash for Quantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.nanos.hash(state);
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

impl Serialize for Quantity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Quantity::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn test_decimal_suffixes() {
        assert_eq!(q("100m").as_nanos(), 100_000_000);
        assert_eq!(q("1").as_nanos(), 1_000_000_000);
        assert_eq!(q("2k").as_nanos(), 2_000_000_000_000);
        assert_eq!(q("500n").as_nanos(), 500);
    }

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(q("1Ki"), q("1024"));
        assert_eq!(q("128Mi"), q("134217728"));
        assert_eq!(q("1Gi").as_nanos(), (1i128 << 30) * 1_000_000_000);
    }

    #[test]
    fn test_equal_amounts_with_different_spelling() {
        assert_eq!(q("0.1"), q("100m"));
        assert_eq!(q("1.5Gi"), q("1536Mi"));
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("1E-3"), q("1m"));
        assert_ne!(q("100m"), q("200m"));
    }

    #[test]
    fn test_keeps_original_spelling() {
        let quantity = q("0.5");
        assert_eq!(quantity.to_string(), "0.5");
        assert_eq!(serde_json::to_string(&quantity).unwrap(), "\"0.5\"");
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(Quantity::parse(""), Err(ApiError::EmptyQuantity));
        for bad in ["abc", "1.2.3", "12Qi", ".", "1e", "-", "10 m", "1x"] {
            assert!(Quantity::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_extreme_exponents_are_out_of_range() {
        for extreme in ["1e2147483647", "0.0000000001e-2147483648"] {
            assert!(
                matches!(
                    Quantity::parse(extreme),
                    Err(ApiError::InvalidQuantity { reason: "number out of range", .. })
                ),
                "{extreme} should be out of range"
            );
        }
    }

    #[test]
    fn test_sub_nano_rounds_up() {
        assert_eq!(q("0.1n").as_nanos(), 1);
    }

    #[test]
    fn test_negative() {
        assert_eq!(q("-1m").as_nanos(), -1_000_000);
    }

    #[test]
    fn test_deserialize_rejects_invalid() {
        let parsed: Result<Quantity, _> = serde_json::from_str("\"lots\"");
        assert!(parsed.is_err());
    }

    proptest! {
        #[test]
        fn prop_milli_matches_fraction(n in 0u32..1_000_000) {
            let milli = q(&format!("{n}m"));
            let whole = q(&format!("{}.{:03}", n / 1000, n % 1000));
            prop_assert_eq!(milli, whole);
        }
    }
}
