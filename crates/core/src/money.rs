//! Monetary amounts in integer cents.
//!
//! Amounts cross service boundaries as decimal strings (e.g. `"200.00"`);
//! internally everything is i64 cents so double-entry checks are exact.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Amount in the smallest currency unit (cents).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Parse a decimal string like `"200.00"`, `"0.5"` or `"-13"`.
    ///
    /// At most two fraction digits are accepted; a single fraction digit
    /// means tenths (`"0.5"` == 50 cents).
    pub fn parse(s: &str) -> DomainResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::validation("empty amount"));
        }
        let (sign, digits) = match s.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1i64, s),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(DomainError::validation(format!("malformed amount '{s}'")));
        }
        if frac.len() > 2 {
            return Err(DomainError::validation(format!(
                "amount '{s}' has sub-cent precision"
            )));
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| DomainError::validation(format!("malformed amount '{s}'")))?
        };
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            n => {
                let parsed: i64 = frac
                    .parse()
                    .map_err(|_| DomainError::validation(format!("malformed amount '{s}'")))?;
                if n == 1 { parsed * 10 } else { parsed }
            }
        };
        whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac_cents))
            .map(|total| Cents(sign * total))
            .ok_or_else(|| DomainError::validation(format!("amount '{s}' out of range")))
    }

    pub fn checked_add(self, other: Cents) -> Option<Cents> {
        self.0.checked_add(other.0).map(Cents)
    }
}

impl core::fmt::Display for Cents {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(Cents::parse("200.00").unwrap(), Cents(20000));
        assert_eq!(Cents::parse("0.5").unwrap(), Cents(50));
        assert_eq!(Cents::parse("13").unwrap(), Cents(1300));
        assert_eq!(Cents::parse("-7.25").unwrap(), Cents(-725));
        assert_eq!(Cents::parse(".99").unwrap(), Cents(99));
    }

    #[test]
    fn rejects_sub_cent_and_garbage() {
        assert!(Cents::parse("1.999").is_err());
        assert!(Cents::parse("").is_err());
        assert!(Cents::parse("12a").is_err());
        assert!(Cents::parse(".").is_err());
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(Cents(20000).to_string(), "200.00");
        assert_eq!(Cents(-725).to_string(), "-7.25");
        assert_eq!(Cents(5).to_string(), "0.05");
    }
}
