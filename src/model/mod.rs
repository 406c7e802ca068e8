//! Types that represent the core data model, such as `Transaction` and `MergedTransaction`.
mod amount;
mod transaction;

pub use amount::{format_amount, Amount, AmountError};
pub use transaction::{MatchKind, MergedTransaction, Provenance, Source, SourceKind, Transaction};
