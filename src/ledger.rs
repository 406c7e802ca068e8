//! The line-oriented ledger document that is masked, handed to the external transform and
//! validated afterwards.
//!
//! Entries are written in Beancount syntax. Each transaction gets a header line, a source comment,
//! one posting on the paying account that carries the amount, and an elided counter posting:
//!
//! ```text
//! 2024-03-05 * "Coffee Shop Downtown"
//!   ; source: credit_card:cmb
//!   Liabilities:CreditCard:Cmb  -128.50 CNY
//!   Expenses:Food
//! ```

use crate::mask::TOKEN_PATTERN;
use crate::model::{format_amount, MergedTransaction, Source};
use crate::rules::AccountRules;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EXPENSES_ACCOUNT: &str = "Expenses:Uncategorized";
pub const DEFAULT_INCOME_ACCOUNT: &str = "Income:Uncategorized";

static HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\S+)\s+([*!])\s+"((?:[^"\\]|\\.)*)"\s*(?:;.*)?$"#)
        .expect("the header pattern is valid")
});

static POSTING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^\s+(?P<account>[A-Z][^\s:]*(?::[^\s:]+)+)(?:\s{{2,}}(?P<sign>[+-]?)(?P<value>{TOKEN_PATTERN}|\d[\d,]*(?:\.\d+)?)\s+(?P<currency>[A-Z][A-Z0-9'._-]*))?\s*(?:;.*)?$"
    ))
    .expect("the posting pattern is valid")
});

static TOKEN_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("^{TOKEN_PATTERN}$")).expect("the token pattern is valid")
});

/// Options for rendering a ledger document.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RenderOptions {
    pub currency: String,
    pub header_comment: Option<String>,
    pub include_source_comment: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            currency: "CNY".to_string(),
            header_comment: None,
            include_source_comment: true,
        }
    }
}

/// Renders transactions as a ledger document.
pub fn render(
    transactions: &[MergedTransaction],
    rules: &AccountRules,
    options: &RenderOptions,
) -> String {
    let mut out = String::new();
    if let Some(comment) = &options.header_comment {
        for line in comment.lines() {
            out.push_str(&format!("; {line}\n"));
        }
        out.push('\n');
    }
    for merged in transactions {
        let txn = merged.transaction();
        out.push_str(&format!(
            "{} * \"{}\"\n",
            txn.occurred_at().format("%Y-%m-%d"),
            escape(txn.description())
        ));
        if options.include_source_comment {
            out.push_str(&format!("  ; source: {}\n", txn.source()));
        }
        out.push_str(&format!(
            "  {}  {} {}\n",
            paying_account(txn.source()),
            format_amount(txn.amount()),
            options.currency
        ));
        let counter = if txn.amount().is_sign_negative() {
            rules
                .account_for(txn.description())
                .unwrap_or(DEFAULT_EXPENSES_ACCOUNT)
        } else {
            DEFAULT_INCOME_ACCOUNT
        };
        out.push_str(&format!("  {counter}\n\n"));
    }
    out
}

/// The account that paid, e.g. `Liabilities:CreditCard:Cmb` or `Assets:DigitalWallet:Wechat`.
pub fn paying_account(source: &Source) -> String {
    let (root, id) = match source {
        Source::CreditCard(id) => ("Liabilities:CreditCard", id),
        Source::DigitalWallet(id) => ("Assets:DigitalWallet", id),
    };
    format!("{root}:{}", account_component(id))
}

/// Turns an institution id into a valid account name component: `cmb` -> `Cmb`,
/// `bank of x` -> `BankOfX`.
fn account_component(id: &str) -> String {
    let component: String = id
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    match component.chars().next() {
        Some(c) if c.is_ascii_uppercase() => component,
        _ => format!("X{component}"),
    }
}

fn escape(s: &str) -> String {
    s.trim().replace('\\', "\\\\").replace('"', "\\\"")
}

/// A monetary value in a posting: a masking token or a plain number.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "text")]
pub enum Value {
    Token(String),
    Number(String),
}

impl Value {
    pub fn text(&self) -> &str {
        match self {
            Value::Token(s) | Value::Number(s) => s,
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, Value::Token(_))
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PostingAmount {
    pub negative: bool,
    pub value: Value,
    pub currency: String,
}

impl PostingAmount {
    /// The value with its sign, e.g. `-__AMT_r_000001__`. Used as the multiset key when comparing
    /// documents.
    pub fn signed(&self) -> String {
        let sign = if self.negative { "-" } else { "" };
        format!("{sign}{}", self.value.text())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Posting {
    pub line: usize,
    pub account: String,
    pub amount: Option<PostingAmount>,
}

/// An entry parsed from a ledger document: a header line and the indented lines below it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Entry {
    /// 1-based line number of the header.
    pub line: usize,
    pub header: String,
    /// The date text when the header is well-formed.
    pub date: Option<String>,
    pub narration: Option<String>,
    pub postings: Vec<Posting>,
    /// Indented lines that are neither postings, comments nor metadata: `(line, text)`.
    pub malformed: Vec<(usize, String)>,
}

impl Entry {
    fn new(line: usize, header: &str) -> Self {
        let caps = HEADER.captures(header);
        Self {
            line,
            header: header.to_string(),
            date: caps.as_ref().map(|c| c[1].to_string()),
            narration: caps.as_ref().map(|c| c[3].to_string()),
            postings: Vec::new(),
            malformed: Vec::new(),
        }
    }

    pub fn is_well_formed_header(&self) -> bool {
        self.date.is_some()
    }

    /// Entries with at least one monetary posting are transactions.
    pub fn is_transaction(&self) -> bool {
        self.postings.iter().any(|p| p.amount.is_some())
    }

    pub fn amounts(&self) -> impl Iterator<Item = &PostingAmount> {
        self.postings.iter().filter_map(|p| p.amount.as_ref())
    }
}

/// Parses a document into entries.
///
/// Any non-indented line that is not blank and not a comment starts an entry, whether or not it
/// is a well-formed header, so that a mangled header still owns its postings. Indented lines
/// belong to the current entry until a blank line. Indented lines outside any entry are ignored.
pub fn parse(document: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut current: Option<Entry> = None;

    for (ix, raw) in document.lines().enumerate() {
        let line_no = ix + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            entries.extend(current.take());
            continue;
        }
        let indented = raw.starts_with(' ') || raw.starts_with('\t');
        if !indented {
            if trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            entries.extend(current.take());
            current = Some(Entry::new(line_no, trimmed));
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if trimmed.starts_with(';') || is_metadata(trimmed) {
            continue;
        }
        match parse_posting(line_no, raw) {
            Some(posting) => entry.postings.push(posting),
            None => entry.malformed.push((line_no, trimmed.to_string())),
        }
    }
    entries.extend(current);
    entries
}

fn parse_posting(line: usize, raw: &str) -> Option<Posting> {
    let caps = POSTING.captures(raw)?;
    let amount = caps.name("value").map(|v| {
        let text = v.as_str().to_string();
        PostingAmount {
            negative: caps.name("sign").is_some_and(|s| s.as_str() == "-"),
            value: if TOKEN_VALUE.is_match(&text) {
                Value::Token(text)
            } else {
                Value::Number(text)
            },
            currency: caps
                .name("currency")
                .map(|c| c.as_str().to_string())
                .unwrap_or_default(),
        }
    });
    Some(Posting {
        line,
        account: caps["account"].to_string(),
        amount,
    })
}

/// Beancount metadata, e.g. `category: "food"`.
fn is_metadata(line: &str) -> bool {
    match line.split_once(':') {
        Some((key, _)) => {
            !key.is_empty()
                && key.starts_with(|c: char| c.is_ascii_lowercase())
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    }
}
