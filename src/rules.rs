//! User rules applied after merging: filters that drop transactions and keyword rules that pick
//! the expenses account a transaction is booked against.

use crate::model::MergedTransaction;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An inclusive range on the signed amount.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AmountRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl AmountRange {
    pub fn contains(&self, amount: Decimal) -> bool {
        self.min <= amount && amount <= self.max
    }
}

/// Transactions matching any of these are left out of the ledger.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Filters {
    /// Case-insensitive substrings of the description.
    #[serde(default)]
    pub skip_keywords: Vec<String>,
    #[serde(default)]
    pub amount_ranges: Vec<AmountRange>,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FilterStats {
    pub kept: usize,
    pub skipped_by_keyword: usize,
    pub skipped_by_amount: usize,
}

impl Filters {
    /// Returns the transactions that pass every filter, in their original order.
    pub fn apply(
        &self,
        transactions: Vec<MergedTransaction>,
    ) -> (Vec<MergedTransaction>, FilterStats) {
        let keywords: Vec<String> = self
            .skip_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let mut stats = FilterStats::default();
        let kept: Vec<MergedTransaction> = transactions
            .into_iter()
            .filter(|merged| {
                let txn = merged.transaction();
                let description = txn.description().to_lowercase();
                if keywords.iter().any(|k| description.contains(k)) {
                    stats.skipped_by_keyword += 1;
                    return false;
                }
                if self.amount_ranges.iter().any(|r| r.contains(txn.amount())) {
                    stats.skipped_by_amount += 1;
                    return false;
                }
                true
            })
            .collect();
        stats.kept = kept.len();
        debug!("{stats:?}");
        (kept, stats)
    }
}

/// Books transactions whose description contains any keyword against `account`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AccountRule {
    pub keywords: Vec<String>,
    pub account: String,
}

impl AccountRule {
    pub fn new<S: Into<String>>(keywords: impl IntoIterator<Item = S>, account: &str) -> Self {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            account: account.to_string(),
        }
    }

    fn matches(&self, description: &str) -> bool {
        self.keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .any(|k| !k.is_empty() && description.contains(&k))
    }
}

/// Ordered account rules; the first matching rule wins.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountRules(Vec<AccountRule>);

impl AccountRules {
    pub fn new(rules: Vec<AccountRule>) -> Self {
        Self(rules)
    }

    pub fn account_for(&self, description: &str) -> Option<&str> {
        let lower = description.to_lowercase();
        self.0
            .iter()
            .find(|r| r.matches(&lower))
            .map(|r| r.account.as_str())
    }
}
