//! Reversible masking of monetary amounts in a text document.
//!
//! Before a document is shown to an untrusted processor every amount in it is replaced with an
//! opaque token such as `__AMT_r20240305_000001__`. The pairs of token and original text are kept
//! in a [`MaskMap`] which is persisted before the document leaves the process, so the real values
//! can always be restored afterwards.
//!
//! # Amount grammar
//!
//! A number is `\d{1,3}(,\d{3})+(\.\d+)?` or `\d+(\.\d+)?`, optionally followed by an exponent
//! `[eE][+-]?\d+`. It must not be preceded by an ASCII word character, a `.` or a `,`, and it
//! must either
//! - be preceded by a currency mark `¥ ￥ $ € £`, optionally with one space, or
//! - be followed by whitespace and a three letter upper-case currency code, or by `元`.
//!
//! Only the number itself is replaced. Signs, spacing and currency marks stay where they are.

use crate::error::{Error, ErrorType};
use crate::{ledger, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Debug, Formatter};
use tracing::{debug, trace};

/// The highest sequence number a token can carry.
pub const MAX_TOKENS: usize = 999_999;

/// Matches any masking token regardless of its run.
pub const TOKEN_PATTERN: &str = r"__AMT_[A-Za-z0-9]+_\d{6}__";

static AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<mark>[¥￥$€£] ?)?(?P<num>\d{1,3}(?:,\d{3})+(?:\.\d+)?(?:[eE][+-]?\d+)?|\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)(?P<code>\s+[A-Z]{3}\b|元)?",
    )
    .expect("the amount pattern is valid")
});

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(TOKEN_PATTERN).expect("the token pattern is valid"));

static LOOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d[\d,]*(?:\.\d+)?(?:[eE][+-]?\d+)?(?:\s+[A-Z]{3}\b|元)")
        .expect("the loose amount pattern is valid")
});

static GLUED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"\d[.,]?{TOKEN_PATTERN}|{TOKEN_PATTERN}\d"))
        .expect("the glued token pattern is valid")
});

/// One substitution: `token` stands for `original` in a masked document.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MaskEntry {
    pub token: String,
    pub original: String,
}

/// The reversible mapping for one run. Entries are only ever appended, and every original string
/// maps to exactly one token.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MaskMapFile", into = "MaskMapFile")]
pub struct MaskMap {
    run_id: String,
    created_at: DateTime<Utc>,
    entries: Vec<MaskEntry>,
    by_original: HashMap<String, usize>,
    by_token: HashMap<String, usize>,
}

/// The on-disk shape of a `MaskMap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct MaskMapFile {
    run_id: String,
    created_at: DateTime<Utc>,
    entries: Vec<MaskEntry>,
}

impl TryFrom<MaskMapFile> for MaskMap {
    type Error = String;

    fn try_from(file: MaskMapFile) -> std::result::Result<Self, Self::Error> {
        validate_run_id(&file.run_id).map_err(|e| e.to_string())?;
        let mut map = MaskMap {
            run_id: file.run_id,
            created_at: file.created_at,
            entries: Vec::with_capacity(file.entries.len()),
            by_original: HashMap::new(),
            by_token: HashMap::new(),
        };
        for entry in file.entries {
            if map.by_token.contains_key(&entry.token) {
                return Err(format!("duplicate token {} in mask map", entry.token));
            }
            if map.by_original.contains_key(&entry.original) {
                return Err(format!("token {} repeats an original value", entry.token));
            }
            map.insert(entry);
        }
        Ok(map)
    }
}

impl From<MaskMap> for MaskMapFile {
    fn from(map: MaskMap) -> Self {
        Self {
            run_id: map.run_id,
            created_at: map.created_at,
            entries: map.entries,
        }
    }
}

// Never print the original amounts.
impl Debug for MaskMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskMap")
            .field("run_id", &self.run_id)
            .field("created_at", &self.created_at)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl MaskMap {
    /// Creates an empty map for `run_id`.
    ///
    /// # Errors
    /// Returns a `MaskingConflict` if `run_id` is empty or not ASCII alphanumeric, since it becomes
    /// part of every token.
    pub fn new(run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        validate_run_id(&run_id)?;
        Ok(Self {
            run_id,
            created_at: Utc::now(),
            entries: Vec::new(),
            by_original: HashMap::new(),
            by_token: HashMap::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn entries(&self) -> &[MaskEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The original text for `token`, if the map knows it.
    pub fn original(&self, token: &str) -> Option<&str> {
        self.by_token
            .get(token)
            .map(|ix| self.entries[*ix].original.as_str())
    }

    /// The token already assigned to `original`, if any.
    pub fn token(&self, original: &str) -> Option<&str> {
        self.by_original
            .get(original)
            .map(|ix| self.entries[*ix].token.as_str())
    }

    /// The prefix shared by every token of this run.
    fn namespace(&self) -> String {
        format!("__AMT_{}_", self.run_id)
    }

    /// Returns the token for `original`, assigning the next one in sequence if needed.
    fn token_for(&mut self, original: &str) -> Result<String> {
        if let Some(token) = self.token(original) {
            return Ok(token.to_string());
        }
        let seq = self.entries.len() + 1;
        if seq > MAX_TOKENS {
            return Err(Error::msg(
                ErrorType::MaskingConflict,
                format!("Run {} has used all {MAX_TOKENS} tokens", self.run_id),
            ));
        }
        let token = format!("{}{seq:06}__", self.namespace());
        if self.by_token.contains_key(&token) {
            return Err(Error::msg(
                ErrorType::MaskingConflict,
                format!("Token {token} is already in use"),
            ));
        }
        self.insert(MaskEntry {
            token: token.clone(),
            original: original.to_string(),
        });
        Ok(token)
    }

    fn insert(&mut self, entry: MaskEntry) {
        let ix = self.entries.len();
        self.by_original.insert(entry.original.clone(), ix);
        self.by_token.insert(entry.token.clone(), ix);
        self.entries.push(entry);
    }
}

/// A masked document together with the map that restores it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Masked {
    pub text: String,
    pub map: MaskMap,
}

/// Counts from an unmasking pass.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UnmaskReport {
    /// Distinct tokens found in the document.
    pub tokens_found: usize,
    /// Token occurrences that were replaced.
    pub tokens_replaced: usize,
    /// Tokens in the map that no longer appear in the document.
    pub tokens_unused: usize,
}

/// Masks every amount in `document` using a new map for `run_id`.
pub fn mask(document: &str, run_id: &str) -> Result<Masked> {
    let mut map = MaskMap::new(run_id)?;
    let text = mask_with(document, &mut map)?;
    Ok(Masked { text, map })
}

/// Masks every amount in `document`, appending any new originals to `map`.
///
/// # Errors
/// Returns a `MaskingConflict` if the document already contains a masking token of any run or if
/// the run runs out of tokens. `map` may have grown when an error is returned.
pub fn mask_with(document: &str, map: &mut MaskMap) -> Result<String> {
    if let Some(existing) = TOKEN.find(document) {
        return Err(Error::msg(
            ErrorType::MaskingConflict,
            format!(
                "The document already contains the masking token {} at byte offset {}, refusing \
                to mask it for run {}",
                existing.as_str(),
                existing.start(),
                map.run_id
            ),
        ));
    }

    let mut out = String::with_capacity(document.len());
    let mut last = 0;
    let mut replaced = 0usize;
    for m in amounts(document) {
        let token = map.token_for(m.text)?;
        out.push_str(&document[last..m.start]);
        out.push_str(&token);
        last = m.end;
        replaced += 1;
    }
    out.push_str(&document[last..]);
    debug!(
        "Masked {replaced} amounts with {} distinct tokens for run {}",
        map.len(),
        map.run_id
    );
    Ok(out)
}

/// Replaces every token in `text` with its original.
///
/// Unmasking text that contains no tokens returns it unchanged.
///
/// # Errors
/// Returns an `UnmaskMismatch` naming the first token that the map does not know. Nothing is
/// substituted in that case.
pub fn unmask(text: &str, map: &MaskMap) -> Result<(String, UnmaskReport)> {
    let tokens = find_tokens(text);
    if let Some(unknown) = tokens.iter().find(|t| map.original(t).is_none()) {
        return Err(Error::msg(
            ErrorType::UnmaskMismatch,
            format!(
                "The document contains token {unknown} which is not in the mask map for run {}",
                map.run_id
            ),
        ));
    }

    let mut replaced = 0usize;
    let restored = TOKEN.replace_all(text, |caps: &Captures<'_>| {
        replaced += 1;
        // Every token was checked above.
        map.original(&caps[0]).unwrap_or_default().to_string()
    });
    let report = UnmaskReport {
        tokens_found: tokens.len(),
        tokens_replaced: replaced,
        tokens_unused: map.len().saturating_sub(tokens.len()),
    };
    trace!("{report:?}");
    Ok((restored.into_owned(), report))
}

/// Returns the distinct tokens in `text` in order of first appearance.
pub fn find_tokens(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|t| seen.insert(*t))
        .map(String::from)
        .collect()
}

/// Fails if `masked` still contains anything that reads as an amount: a match of the amount
/// grammar, a number with any grouping followed by a currency code, a ledger posting with a plain
/// number, or digits glued to a token.
///
/// The offending values are not included in the error, only their positions.
pub fn check_redacted(masked: &str) -> Result<()> {
    let offsets: BTreeSet<usize> = amounts(masked)
        .map(|m| m.start)
        .chain(loose_amounts(masked))
        .chain(GLUED.find_iter(masked).map(|m| m.start()))
        .collect();
    let lines: Vec<usize> = ledger::parse(masked)
        .iter()
        .flat_map(|entry| entry.postings.iter())
        .filter(|p| p.amount.as_ref().is_some_and(|a| !a.value.is_token()))
        .map(|p| p.line)
        .collect();
    if offsets.is_empty() && lines.is_empty() {
        return Ok(());
    }
    Err(Error::msg(
        ErrorType::MaskingConflict,
        format!(
            "{} raw amounts remain in the masked document at byte offsets {offsets:?} and \
            posting lines {lines:?}",
            offsets.len() + lines.len()
        ),
    ))
}

/// An amount found in a document. `start..end` covers only the number.
struct AmountMatch<'a> {
    start: usize,
    end: usize,
    text: &'a str,
}

fn amounts(text: &str) -> impl Iterator<Item = AmountMatch<'_>> {
    AMOUNT.captures_iter(text).filter_map(move |caps| {
        let num = caps.name("num")?;
        let has_mark = caps.name("mark").is_some();
        if !has_mark && caps.name("code").is_none() {
            return None;
        }
        if !has_mark {
            let before = text[..num.start()].chars().next_back();
            if before.is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ',')) {
                return None;
            }
        }
        Some(AmountMatch {
            start: num.start(),
            end: num.end(),
            text: num.as_str(),
        })
    })
}

/// Start offsets of numbers followed by a currency code, whatever their digit grouping.
fn loose_amounts(text: &str) -> impl Iterator<Item = usize> + '_ {
    LOOSE.find_iter(text).map(|m| m.start()).filter(move |start| {
        let before = text[..*start].chars().next_back();
        !before.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() || !run_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::msg(
            ErrorType::MaskingConflict,
            format!("The run id '{run_id}' must be non-empty and ASCII alphanumeric"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEDGER: &str = r#"2024-03-05 * "Coffee Shop Downtown"
  ; source: credit_card:cmb
  Liabilities:CreditCard:Cmb  -128.50 CNY
  Expenses:Food

2024-03-06 * "Salary"
  Assets:DigitalWallet:Wechat  12,000.00 CNY
  Income:Uncategorized
"#;

    #[test]
    fn test_same_amount_same_token() {
        let masked = mask("Total: 128.50 CNY, Tip: 128.50 CNY", "run1").unwrap();
        assert_eq!(
            masked.text,
            "Total: __AMT_run1_000001__ CNY, Tip: __AMT_run1_000001__ CNY"
        );
        assert_eq!(masked.map.len(), 1);
        let (restored, report) = unmask(&masked.text, &masked.map).unwrap();
        assert_eq!(restored, "Total: 128.50 CNY, Tip: 128.50 CNY");
        assert_eq!(report.tokens_found, 1);
        assert_eq!(report.tokens_replaced, 2);
        assert_eq!(report.tokens_unused, 0);
    }

    #[test]
    fn test_round_trip_ledger() {
        let masked = mask(LEDGER, "abc").unwrap();
        assert!(!masked.text.contains("128.50"));
        assert!(!masked.text.contains("12,000.00"));
        assert!(masked.text.contains("-__AMT_abc_000001__ CNY"));
        assert!(masked.text.contains("2024-03-05"));
        let (restored, _) = unmask(&masked.text, &masked.map).unwrap();
        assert_eq!(restored, LEDGER);
    }

    #[test]
    fn test_grammar_variants() {
        let doc = "¥45 and $ 3.5 and €1e3 and 88元 and 7 USD but not 2024-03-05 or ID123 CNY or 1.5 cny";
        let masked = mask(doc, "g").unwrap();
        assert_eq!(
            masked.text,
            "¥__AMT_g_000001__ and $ __AMT_g_000002__ and €__AMT_g_000003__ and \
            __AMT_g_000004__元 and __AMT_g_000005__ USD but not 2024-03-05 or ID123 CNY or 1.5 cny"
        );
        let originals: Vec<&str> = masked
            .map
            .entries()
            .iter()
            .map(|e| e.original.as_str())
            .collect();
        assert_eq!(originals, vec!["45", "3.5", "1e3", "88", "7"]);
    }

    #[test]
    fn test_distinct_strings_get_distinct_tokens() {
        // Numerically equal but textually different strings are separate originals.
        let masked = mask("1.50 CNY 1.5 CNY", "r").unwrap();
        assert_eq!(masked.map.len(), 2);
        let (restored, _) = unmask(&masked.text, &masked.map).unwrap();
        assert_eq!(restored, "1.50 CNY 1.5 CNY");
    }

    #[test]
    fn test_document_without_amounts() {
        let masked = mask("no money here", "r").unwrap();
        assert_eq!(masked.text, "no money here");
        assert!(masked.map.is_empty());
    }

    #[test]
    fn test_unmask_is_noop_without_tokens() {
        let masked = mask(LEDGER, "abc").unwrap();
        let (restored, report) = unmask(LEDGER, &masked.map).unwrap();
        assert_eq!(restored, LEDGER);
        assert_eq!(report.tokens_found, 0);
        assert_eq!(report.tokens_unused, 2);
    }

    #[test]
    fn test_unmask_unknown_token() {
        let masked = mask("9.99 CNY", "abc").unwrap();
        let tampered = format!("{} __AMT_abc_000002__ CNY", masked.text);
        let err = unmask(&tampered, &masked.map).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::UnmaskMismatch);
        assert!(err.to_string().contains("__AMT_abc_000002__"));
    }

    #[test]
    fn test_unmask_token_from_other_run() {
        let masked = mask("9.99 CNY", "abc").unwrap();
        let err = unmask("__AMT_xyz_000001__ CNY", &masked.map).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::UnmaskMismatch);
    }

    #[test]
    fn test_mask_refuses_existing_tokens() {
        let err = mask("already __AMT_abc_000001__ CNY", "abc").unwrap_err();
        assert_eq!(err.error_type(), ErrorType::MaskingConflict);
        // A token of another run would survive masking and then fail to unmask.
        let err = mask("Ref __AMT_old_000001__\n  X  -1.00 CNY\n", "new").unwrap_err();
        assert_eq!(err.error_type(), ErrorType::MaskingConflict);
        assert!(err.to_string().contains("__AMT_old_000001__"));
    }

    #[test]
    fn test_invalid_run_id() {
        assert_eq!(
            mask("1 CNY", "").unwrap_err().error_type(),
            ErrorType::MaskingConflict
        );
        assert_eq!(
            mask("1 CNY", "a_b").unwrap_err().error_type(),
            ErrorType::MaskingConflict
        );
    }

    #[test]
    fn test_token_exhaustion() {
        let mut map = MaskMap::new("r").unwrap();
        for i in 0..MAX_TOKENS {
            map.insert(MaskEntry {
                token: format!("t{i}"),
                original: format!("o{i}"),
            });
        }
        let err = mask_with("1.00 CNY", &mut map).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::MaskingConflict);
    }

    #[test]
    fn test_mask_with_appends_and_reuses() {
        let mut map = MaskMap::new("r").unwrap();
        let first = mask_with("5.00 CNY", &mut map).unwrap();
        let second = mask_with("6.00 CNY 5.00 CNY", &mut map).unwrap();
        assert_eq!(first, "__AMT_r_000001__ CNY");
        assert_eq!(second, "__AMT_r_000002__ CNY __AMT_r_000001__ CNY");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_check_redacted() {
        let masked = mask(LEDGER, "abc").unwrap();
        check_redacted(&masked.text).unwrap();
        let err = check_redacted(LEDGER).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::MaskingConflict);
        assert!(!err.to_string().contains("128.50"));
    }

    #[test]
    fn test_irregular_grouping_is_not_partly_masked() {
        let doc = "  Liabilities:CreditCard:Cmb  -1234,567.00 CNY\n";
        let masked = mask(doc, "r").unwrap();
        assert_eq!(masked.text, doc);
        let err = check_redacted(&masked.text).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::MaskingConflict);
        assert!(!err.to_string().contains("567"));
        // The same number in free text is caught too.
        assert!(check_redacted("paid 1234,567.00 CNY today").is_err());
    }

    #[test]
    fn test_unknown_commodity_fails_redaction() {
        let doc = "2024-03-05 * \"A\"\n  Liabilities:CreditCard:Cmb  -128.50 USDT\n  Expenses:X\n";
        let masked = mask(doc, "r").unwrap();
        assert!(masked.map.is_empty());
        let err = check_redacted(&masked.text).unwrap_err();
        assert!(err.to_string().contains("posting lines [2]"));
    }

    #[test]
    fn test_digits_glued_to_token_fail_redaction() {
        assert!(check_redacted("x 1__AMT_r_000001__ CNY").is_err());
        assert!(check_redacted("x 12,__AMT_r_000001__ CNY").is_err());
        assert!(check_redacted("x __AMT_r_000001__7 CNY").is_err());
        assert!(check_redacted("x -__AMT_r1_000001__ CNY, ID123 CNY").is_ok());
    }

    #[test]
    fn test_find_tokens_first_appearance_order() {
        let text = "__AMT_a_000002__ x __AMT_a_000001__ y __AMT_a_000002__";
        assert_eq!(
            find_tokens(text),
            vec!["__AMT_a_000002__".to_string(), "__AMT_a_000001__".to_string()]
        );
    }

    #[test]
    fn test_map_serde_round_trip() {
        let masked = mask(LEDGER, "abc").unwrap();
        let json = serde_json::to_string(&masked.map).unwrap();
        assert!(json.contains("\"entries\""));
        let loaded: MaskMap = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, masked.map);
        assert_eq!(loaded.token("128.50"), Some("__AMT_abc_000001__"));
    }

    #[test]
    fn test_map_rejects_duplicate_tokens() {
        let json = r#"{"run_id":"abc","created_at":"2024-03-05T00:00:00Z","entries":[
            {"token":"__AMT_abc_000001__","original":"1.00"},
            {"token":"__AMT_abc_000001__","original":"2.00"}]}"#;
        assert!(serde_json::from_str::<MaskMap>(json).is_err());
    }

    #[test]
    fn test_debug_hides_originals() {
        let masked = mask("128.50 CNY", "abc").unwrap();
        assert!(!format!("{:?}", masked.map).contains("128.50"));
    }
}
