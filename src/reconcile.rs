//! Certifies that a transformed document still describes the same transactions as the document
//! that was sent out.
//!
//! Both documents are parsed into entries (see [`crate::ledger`]) and compared on three things,
//! in order:
//! 1. the number of transaction entries,
//! 2. the multiset of signed amount values, which in a masked document are tokens,
//! 3. the shape of each transaction entry in the transformed document.
//!
//! Narration, comments and account names may change freely. Neither document is modified.

use crate::ledger::{parse, Entry};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use tracing::debug;

/// One difference between the two documents. `index` is the position of the transaction entry in
/// the transformed document, `line` its 1-based line number.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Discrepancy {
    /// Transaction entries were added or removed.
    CountMismatch { pre: usize, post: usize },
    /// A signed value occurs fewer times after the transform.
    MissingAmount {
        value: String,
        expected: usize,
        found: usize,
    },
    /// A signed value occurs more times after the transform, or was invented.
    UnexpectedAmount {
        value: String,
        expected: usize,
        found: usize,
    },
    MalformedHeader {
        index: usize,
        line: usize,
        text: String,
    },
    InvalidDate {
        index: usize,
        line: usize,
        date: String,
    },
    MalformedPosting {
        index: usize,
        line: usize,
        text: String,
    },
    /// A real number appears where the original document only had masking tokens.
    UnmaskedAmount {
        index: usize,
        line: usize,
    },
}

impl Display for Discrepancy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Discrepancy::CountMismatch { pre, post } => {
                write!(f, "transaction count changed from {pre} to {post}")
            }
            Discrepancy::MissingAmount {
                value,
                expected,
                found,
            } => write!(f, "{value} expected {expected} times, found {found}"),
            Discrepancy::UnexpectedAmount {
                value,
                expected,
                found,
            } => write!(f, "{value} found {found} times, expected {expected}"),
            Discrepancy::MalformedHeader { index, line, text } => {
                write!(f, "entry {index} (line {line}) has a malformed header: {text}")
            }
            Discrepancy::InvalidDate { index, line, date } => {
                write!(f, "entry {index} (line {line}) has an invalid date '{date}'")
            }
            Discrepancy::MalformedPosting { index, line, text } => {
                write!(f, "entry {index} has a malformed line {line}: {text}")
            }
            Discrepancy::UnmaskedAmount { index, line } => {
                write!(f, "entry {index} (line {line}) carries an unmasked amount")
            }
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconciliationReport {
    pub pre_count: usize,
    pub post_count: usize,
    pub matched: bool,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    /// One line per discrepancy, or a short confirmation.
    pub fn summary(&self) -> String {
        if self.matched {
            return format!(
                "Documents reconcile: {} transactions, no discrepancies",
                self.pre_count
            );
        }
        let mut s = format!(
            "Documents do not reconcile ({} before, {} after), {} discrepancies:",
            self.pre_count,
            self.post_count,
            self.discrepancies.len()
        );
        for d in &self.discrepancies {
            s.push_str(&format!("\n  - {d}"));
        }
        s
    }
}

/// Compares the document sent to the transform with the document that came back.
pub fn reconcile(pre_document: &str, post_document: &str) -> ReconciliationReport {
    let pre: Vec<Entry> = transactions(pre_document);
    let post: Vec<Entry> = transactions(post_document);
    let mut discrepancies = Vec::new();

    if pre.len() != post.len() {
        discrepancies.push(Discrepancy::CountMismatch {
            pre: pre.len(),
            post: post.len(),
        });
    }

    let before = count_values(&pre);
    let after = count_values(&post);
    for (value, expected) in &before {
        let found = after.get(value).copied().unwrap_or(0);
        if found < *expected {
            discrepancies.push(Discrepancy::MissingAmount {
                value: value.clone(),
                expected: *expected,
                found,
            });
        }
    }
    for (value, found) in &after {
        let expected = before.get(value).copied().unwrap_or(0);
        if *found > expected {
            discrepancies.push(Discrepancy::UnexpectedAmount {
                value: value.clone(),
                expected,
                found: *found,
            });
        }
    }

    let pre_masked = pre.iter().flat_map(Entry::amounts).any(|a| a.value.is_token());
    for (index, entry) in post.iter().enumerate() {
        check_shape(index, entry, pre_masked, &mut discrepancies);
    }

    let report = ReconciliationReport {
        pre_count: pre.len(),
        post_count: post.len(),
        matched: discrepancies.is_empty(),
        discrepancies,
    };
    debug!(
        "Reconciled {} against {} transactions, {} discrepancies",
        report.pre_count,
        report.post_count,
        report.discrepancies.len()
    );
    report
}

fn transactions(document: &str) -> Vec<Entry> {
    parse(document)
        .into_iter()
        .filter(Entry::is_transaction)
        .collect()
}

fn count_values(entries: &[Entry]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for amount in entries.iter().flat_map(Entry::amounts) {
        *counts.entry(amount.signed()).or_insert(0) += 1;
    }
    counts
}

fn check_shape(index: usize, entry: &Entry, pre_masked: bool, out: &mut Vec<Discrepancy>) {
    match &entry.date {
        None => out.push(Discrepancy::MalformedHeader {
            index,
            line: entry.line,
            text: entry.header.clone(),
        }),
        Some(date) => {
            if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
                out.push(Discrepancy::InvalidDate {
                    index,
                    line: entry.line,
                    date: date.clone(),
                });
            }
        }
    }
    for (line, text) in &entry.malformed {
        out.push(Discrepancy::MalformedPosting {
            index,
            line: *line,
            text: text.clone(),
        });
    }
    if pre_masked {
        for posting in &entry.postings {
            if posting.amount.as_ref().is_some_and(|a| !a.value.is_token()) {
                out.push(Discrepancy::UnmaskedAmount {
                    index,
                    line: posting.line,
                });
            }
        }
    }
}
