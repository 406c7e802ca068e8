//! Parsing of raw amount text as it comes out of statement parsers.
//!
//! Parsers hand us whatever the bank printed: `¥1,234.50`, `-128.50/CNY`, `存入 300.00`,
//! `45.00元`. This module cleans that text into an exact `Decimal` and formats decimals back into
//! the two-place form used in ledger documents.

use rust_decimal::Decimal;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Marks a deposit in the amount column of some bank statements.
pub(crate) const DEPOSIT_MARKER: &str = "存入";

const CURRENCY_MARKS: &[char] = &['¥', '￥', '$', '€', '£'];
const CURRENCY_SUFFIXES: &[&str] = &["/CNY", "CNY", "RMB", "元"];

/// An amount parsed from raw statement text.
///
/// `deposit` is set when the text carried the deposit marker, which some banks use in place of a
/// sign.
///
/// ```
/// # use ledger_reconcile::model::Amount;
/// # use std::str::FromStr;
/// let amount = Amount::from_str("-¥1,234.50").unwrap();
/// assert_eq!(amount.value().to_string(), "-1234.50");
/// assert!(!amount.is_deposit());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount {
    value: Decimal,
    deposit: bool,
}

impl Amount {
    pub const fn new(value: Decimal) -> Self {
        Self {
            value,
            deposit: false,
        }
    }

    /// Returns the underlying Decimal value.
    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn is_deposit(&self) -> bool {
        self.deposit
    }
}

/// An error that can occur when cleaning amount text.
pub enum AmountError {
    Empty,
    MultipleDecimalPoints(String),
    Invalid(String, rust_decimal::Error),
}

impl Debug for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AmountError::Empty => write!(f, "the amount is empty"),
            AmountError::MultipleDecimalPoints(s) => {
                write!(f, "the amount '{s}' has more than one decimal point")
            }
            AmountError::Invalid(s, e) => write!(f, "the amount '{s}' is not a number: {e}"),
        }
    }
}

impl std::error::Error for AmountError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AmountError::Invalid(_, e) => Some(e),
            _ => None,
        }
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut text = s.trim().to_string();
        if text.is_empty() {
            return Err(AmountError::Empty);
        }

        let deposit = text.contains(DEPOSIT_MARKER);
        if deposit {
            text = text.replace(DEPOSIT_MARKER, "");
        }

        for suffix in CURRENCY_SUFFIXES {
            text = text.replace(suffix, "");
        }

        // Currency marks, thousands separators and any whitespace left between sign and digits.
        let cleaned: String = text
            .chars()
            .filter(|c| !CURRENCY_MARKS.contains(c) && *c != ',' && !c.is_whitespace())
            .collect();

        if cleaned.is_empty() {
            return Err(AmountError::Empty);
        }
        if cleaned.matches('.').count() > 1 {
            return Err(AmountError::MultipleDecimalPoints(s.trim().to_string()));
        }
        let unsigned = cleaned.strip_prefix('+').unwrap_or(&cleaned);

        let value =
            Decimal::from_str(unsigned).map_err(|e| AmountError::Invalid(s.trim().to_string(), e))?;
        Ok(Self { value, deposit })
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.value()
    }
}

/// Formats a decimal with exactly two places, e.g. `-128.5` becomes `-128.50`.
pub fn format_amount(value: Decimal) -> String {
    let mut rounded = value.round_dp(2);
    rounded.rescale(2);
    rounded.to_string()
}
