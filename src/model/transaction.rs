use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Where a transaction came from. The identifier is the bank id for credit cards and the provider
/// id for digital wallets, e.g. `cmb` or `wechat`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Source {
    CreditCard(String),
    DigitalWallet(String),
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::CreditCard(_) => SourceKind::CreditCard,
            Source::DigitalWallet(_) => SourceKind::DigitalWallet,
        }
    }

    /// The bank or provider id.
    pub fn institution(&self) -> &str {
        match self {
            Source::CreditCard(id) | Source::DigitalWallet(id) => id,
        }
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.institution())
    }
}

/// The kind of a `Source` without its identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    CreditCard,
    DigitalWallet,
}

serde_plain::derive_display_from_serialize!(SourceKind);
serde_plain::derive_fromstr_from_deserialize!(SourceKind);

/// The canonical transaction record. Once built it is never modified; the merge engine produces
/// new values instead.
///
/// Amounts follow one sign convention for every source: outflows are negative, inflows positive.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Transaction {
    occurred_at: NaiveDate,
    amount: Decimal,
    description: String,
    source: Source,
    account_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    external_ref: Option<String>,
}

impl Transaction {
    pub fn new(
        occurred_at: NaiveDate,
        amount: Decimal,
        description: impl Into<String>,
        source: Source,
        account_ref: impl Into<String>,
    ) -> Self {
        Self {
            occurred_at,
            amount,
            description: description.into(),
            source,
            account_ref: account_ref.into(),
            external_ref: None,
        }
    }

    /// Attaches a correlation key pointing at the card that funded a digital-wallet payment.
    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    /// Returns a copy of this transaction carrying a different description.
    pub fn with_description(&self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self.clone()
        }
    }

    pub fn occurred_at(&self) -> NaiveDate {
        self.occurred_at
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn account_ref(&self) -> &str {
        &self.account_ref
    }

    pub fn external_ref(&self) -> Option<&str> {
        self.external_ref.as_deref()
    }

    /// The ordering used everywhere a deterministic order is needed: date, amount, description,
    /// then the remaining fields so that distinct records never compare equal. Amounts that are
    /// numerically equal but written with a different scale (`-9.0`, `-9.00`) order by scale.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        self.occurred_at
            .cmp(&other.occurred_at)
            .then_with(|| self.amount.cmp(&other.amount))
            .then_with(|| self.description.cmp(&other.description))
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.account_ref.cmp(&other.account_ref))
            .then_with(|| self.external_ref.cmp(&other.external_ref))
            .then_with(|| self.amount.scale().cmp(&other.amount.scale()))
    }
}

/// How a digital-wallet transaction was matched to a credit-card transaction.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Date, absolute amount and the card suffix named by the wallet's correlation key agree.
    Correlated,
    /// Date and absolute amount agree and exactly one card transaction was a candidate.
    DateAmount,
}

serde_plain::derive_display_from_serialize!(MatchKind);

/// The records that produced a `MergedTransaction`. Kept for auditing; never rendered.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Provenance {
    /// The transaction had no counterpart in the other source.
    Standalone,
    Merged {
        credit_card: Transaction,
        digital: Transaction,
        matched_by: MatchKind,
    },
}

/// One entry of the merged ledger.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MergedTransaction {
    transaction: Transaction,
    provenance: Provenance,
}

impl MergedTransaction {
    pub fn standalone(transaction: Transaction) -> Self {
        Self {
            transaction,
            provenance: Provenance::Standalone,
        }
    }

    pub fn merged(
        transaction: Transaction,
        credit_card: Transaction,
        digital: Transaction,
        matched_by: MatchKind,
    ) -> Self {
        Self {
            transaction,
            provenance: Provenance::Merged {
                credit_card,
                digital,
                matched_by,
            },
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn is_merged(&self) -> bool {
        matches!(self.provenance, Provenance::Merged { .. })
    }
}
