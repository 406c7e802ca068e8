//! Cross-source deduplication of credit-card and digital-wallet transactions.
//!
//! A wallet payment funded by a credit card shows up twice: once on the card statement, usually
//! under a generic processor name, and once in the wallet export with the real merchant. The
//! engine finds these pairs, keeps the card record as the financial truth, gives it the more
//! informative description and drops the wallet record.
//!
//! Matching, for each wallet transaction in sorted order:
//! 1. If the wallet record carries a correlation key, the first unconsumed card transaction with
//!    the same date, the same absolute amount and the same account suffix is accepted.
//! 2. Otherwise, or if nothing correlates, unconsumed card transactions with the same date and
//!    absolute amount are candidates. Exactly one candidate is accepted. Several candidates are
//!    ambiguous and nothing is merged.
//! 3. With no candidate the wallet transaction is kept on its own.
//!
//! Each card transaction is consumed at most once. Both inputs are sorted with
//! `Transaction::sort_cmp` first, so the output does not depend on input order.

use crate::error::{Error, ErrorType};
use crate::model::{MatchKind, MergedTransaction, SourceKind, Transaction};
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Processor names that say nothing about the merchant.
pub const DEFAULT_GENERIC_DESCRIPTIONS: &[&str] = &[
    "unionpay",
    "银联",
    "alipay",
    "支付宝",
    "tenpay",
    "财付通",
    "wechat pay",
    "微信支付",
    "快捷支付",
    "merchant",
];

/// Number of trailing digits compared when correlating a wallet record with a card.
const SUFFIX_DIGITS: usize = 4;

/// Settings for the description heuristic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MergeOptions {
    generic_descriptions: Vec<String>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::new(DEFAULT_GENERIC_DESCRIPTIONS.iter().copied())
    }
}

impl MergeOptions {
    pub fn new<S: AsRef<str>>(generic_descriptions: impl IntoIterator<Item = S>) -> Self {
        Self {
            generic_descriptions: generic_descriptions
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// A description is generic when it is empty or names a payment processor.
    pub fn is_generic(&self, description: &str) -> bool {
        let lower = description.trim().to_lowercase();
        lower.is_empty() || self.generic_descriptions.iter().any(|g| lower.contains(g))
    }

    /// Picks the more informative of two descriptions:
    /// - a non-generic description beats a generic one,
    /// - otherwise the longer one, counted in characters after trimming,
    /// - ties keep the credit-card description.
    pub fn pick_description<'a>(&self, credit_card: &'a str, digital: &'a str) -> &'a str {
        let card_generic = self.is_generic(credit_card);
        let digital_generic = self.is_generic(digital);
        let chosen = match (card_generic, digital_generic) {
            (true, false) => digital,
            (false, true) => credit_card,
            _ => {
                if digital.trim().chars().count() > credit_card.trim().chars().count() {
                    digital
                } else {
                    credit_card
                }
            }
        };
        chosen.trim()
    }
}

/// Counts reported alongside the merged transactions.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MergeStats {
    pub credit_card_in: usize,
    pub digital_in: usize,
    pub correlated: usize,
    pub fallback: usize,
    pub ambiguous: usize,
    pub standalone_digital: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MergeOutput {
    transactions: Vec<MergedTransaction>,
    stats: MergeStats,
}

impl MergeOutput {
    pub fn transactions(&self) -> &[MergedTransaction] {
        &self.transactions
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn into_transactions(self) -> Vec<MergedTransaction> {
        self.transactions
    }
}

/// Merges the two lists into one sorted, deduplicated list. The inputs are not modified.
///
/// # Errors
/// Returns an `InputContractViolation` if a list contains a record of the wrong source kind.
pub fn merge(
    credit_card: &[Transaction],
    digital: &[Transaction],
    options: &MergeOptions,
) -> Result<MergeOutput> {
    check_kind(credit_card, SourceKind::CreditCard)?;
    check_kind(digital, SourceKind::DigitalWallet)?;

    let mut cards: Vec<&Transaction> = credit_card.iter().collect();
    cards.sort_by(|a, b| a.sort_cmp(b));
    let mut wallets: Vec<&Transaction> = digital.iter().collect();
    wallets.sort_by(|a, b| a.sort_cmp(b));

    let mut stats = MergeStats {
        credit_card_in: cards.len(),
        digital_in: wallets.len(),
        ..MergeStats::default()
    };

    // For each card, the wallet transaction it was merged with.
    let mut consumed: Vec<Option<(&Transaction, MatchKind)>> = vec![None; cards.len()];
    let mut standalone: Vec<&Transaction> = Vec::new();

    for wallet in wallets {
        match find_match(&cards, &consumed, wallet) {
            Matched::One(ix, kind) => {
                debug!(
                    "Matched {} on {} with card record {ix} by {kind}",
                    wallet.source(),
                    wallet.occurred_at()
                );
                match kind {
                    MatchKind::Correlated => stats.correlated += 1,
                    MatchKind::DateAmount => stats.fallback += 1,
                }
                consumed[ix] = Some((wallet, kind));
            }
            Matched::Ambiguous(n) => {
                warn!(
                    "Ambiguous match for {} on {}: {n} card transactions share the date and \
                    amount, keeping them separate",
                    wallet.source(),
                    wallet.occurred_at()
                );
                stats.ambiguous += 1;
                standalone.push(wallet);
            }
            Matched::None => standalone.push(wallet),
        }
    }
    stats.standalone_digital = standalone.len();

    let mut transactions: Vec<MergedTransaction> = cards
        .iter()
        .zip(consumed)
        .map(|(card, matched)| match matched {
            Some((wallet, kind)) => {
                let description = options.pick_description(card.description(), wallet.description());
                MergedTransaction::merged(
                    card.with_description(description),
                    (*card).clone(),
                    wallet.clone(),
                    kind,
                )
            }
            None => MergedTransaction::standalone((*card).clone()),
        })
        .chain(
            standalone
                .into_iter()
                .map(|t| MergedTransaction::standalone(t.clone())),
        )
        .collect();
    transactions.sort_by(|a, b| a.transaction().sort_cmp(b.transaction()));
    stats.total = transactions.len();

    info!(
        "Merged {} credit card and {} digital transactions into {} ({} correlated, {} by date \
        and amount, {} ambiguous)",
        stats.credit_card_in,
        stats.digital_in,
        stats.total,
        stats.correlated,
        stats.fallback,
        stats.ambiguous
    );

    Ok(MergeOutput {
        transactions,
        stats,
    })
}

enum Matched {
    One(usize, MatchKind),
    Ambiguous(usize),
    None,
}

fn find_match(
    cards: &[&Transaction],
    consumed: &[Option<(&Transaction, MatchKind)>],
    wallet: &Transaction,
) -> Matched {
    let candidates: Vec<usize> = cards
        .iter()
        .enumerate()
        .filter(|(ix, card)| {
            consumed[*ix].is_none()
                && card.occurred_at() == wallet.occurred_at()
                && card.amount().abs() == wallet.amount().abs()
        })
        .map(|(ix, _)| ix)
        .collect();

    if let Some(wallet_suffix) = wallet.external_ref().and_then(account_suffix) {
        let correlated = candidates
            .iter()
            .copied()
            .find(|ix| account_suffix(cards[*ix].account_ref()) == Some(wallet_suffix.clone()));
        if let Some(ix) = correlated {
            return Matched::One(ix, MatchKind::Correlated);
        }
    }

    match candidates.as_slice() {
        [] => Matched::None,
        [ix] => Matched::One(*ix, MatchKind::DateAmount),
        many => Matched::Ambiguous(many.len()),
    }
}

/// The trailing card digits of an account reference, e.g. `1234` for `6222****1234` or
/// `card-1234`. Returns `None` when there are too few digits to correlate on.
fn account_suffix(account_ref: &str) -> Option<String> {
    let digits: Vec<char> = account_ref.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < SUFFIX_DIGITS {
        return None;
    }
    Some(digits[digits.len() - SUFFIX_DIGITS..].iter().collect())
}

fn check_kind(transactions: &[Transaction], expected: SourceKind) -> Result<()> {
    match transactions
        .iter()
        .position(|t| t.source().kind() != expected)
    {
        Some(ix) => Err(Error::msg(
            ErrorType::InputContractViolation,
            format!(
                "Transaction {ix} in the {expected} list comes from {}",
                transactions[ix].source()
            ),
        )),
        None => Ok(()),
    }
}
