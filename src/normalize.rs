//! Turns the common record shape emitted by per-institution parsers into `Transaction` values.
//!
//! Parsers write CSV with the headers
//! `source,institution,date,amount,description,account_ref,external_ref,flow`. Every record must
//! carry a date and an amount that can be cleaned into a decimal. A single bad record fails the
//! whole batch, because silently dropping a row would corrupt the totals.

use crate::error::{Error, ErrorType, IntoResult, Res};
use crate::model::{Amount, Source, SourceKind, Transaction};
use crate::{utils, Result};
use anyhow::{bail, Context};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"];

/// Direction of money for sources that print unsigned amounts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Outflow,
    Inflow,
}

/// One row of parser output, before any cleaning.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RawRecord {
    pub source: String,
    pub institution: String,
    pub date: String,
    pub amount: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub account_ref: String,
    #[serde(default)]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub flow: Option<Flow>,
}

/// Reads parser output from a CSV file.
pub async fn read_records(path: &Path) -> Result<Vec<RawRecord>> {
    let content = utils::read(path).await.pub_result(ErrorType::Storage)?;
    parse_records(&content)
        .with_context(|| format!("Unable to read records from {}", path.display()))
        .pub_result(ErrorType::InputContractViolation)
}

pub(crate) fn parse_records(csv_text: &str) -> Res<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(csv_text.as_bytes());
    let mut records = Vec::new();
    for (ix, row) in reader.deserialize().enumerate() {
        // Row 1 is the header.
        let record: RawRecord = row.with_context(|| format!("Malformed CSV row {}", ix + 2))?;
        records.push(record);
    }
    Ok(records)
}

/// Normalizes a batch of records that must all come from sources of kind `expected`.
///
/// # Errors
/// Returns an `InputContractViolation` naming the first offending record if any record lacks a
/// date, has an amount that cannot be cleaned, or comes from a different kind of source.
pub fn normalize_all(records: &[RawRecord], expected: SourceKind) -> Result<Vec<Transaction>> {
    let mut out = Vec::with_capacity(records.len());
    for (ix, record) in records.iter().enumerate() {
        let txn = normalize(record)
            .with_context(|| format!("Record {ix} ({}) is invalid", record.institution))
            .pub_result(ErrorType::InputContractViolation)?;
        if txn.source().kind() != expected {
            return Err(Error::msg(
                ErrorType::InputContractViolation,
                format!(
                    "Record {ix} is a {} record but a {expected} batch was expected",
                    txn.source().kind()
                ),
            ));
        }
        out.push(txn);
    }
    debug!("Normalized {} {expected} records", out.len());
    Ok(out)
}

/// Normalizes a single record.
pub fn normalize(record: &RawRecord) -> Res<Transaction> {
    let kind = SourceKind::from_str(record.source.trim())
        .map_err(|_| anyhow::anyhow!("Unknown source '{}'", record.source))?;
    let institution = record.institution.trim();
    if institution.is_empty() {
        bail!("The institution is missing");
    }
    let source = match kind {
        SourceKind::CreditCard => Source::CreditCard(institution.to_string()),
        SourceKind::DigitalWallet => Source::DigitalWallet(institution.to_string()),
    };

    let occurred_at = parse_date(&record.date)?;
    let parsed = Amount::from_str(&record.amount).context("The amount cannot be parsed")?;
    let value = parsed.value();
    let amount = match (record.flow, parsed.is_deposit()) {
        (Some(Flow::Outflow), _) => -value.abs(),
        (Some(Flow::Inflow), _) | (None, true) => value.abs(),
        (None, false) => value,
    };

    let mut txn = Transaction::new(
        occurred_at,
        amount,
        record.description.trim(),
        source,
        record.account_ref.trim(),
    );
    if let Some(external_ref) = record
        .external_ref
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        txn = txn.with_external_ref(external_ref);
    }
    Ok(txn)
}

/// Parses the date formats that statement parsers emit. Time of day is dropped.
pub fn parse_date(s: &str) -> Res<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        bail!("The date is missing");
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Ok(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(datetime.date());
        }
    }
    bail!("The date '{s}' is not in a recognized format")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn record(source: &str, amount: &str) -> RawRecord {
        RawRecord {
            source: source.into(),
            institution: "cmb".into(),
            date: "2024-03-05".into(),
            amount: amount.into(),
            description: " Coffee Shop ".into(),
            account_ref: "6222****1234".into(),
            external_ref: None,
            flow: None,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(parse_date("2024-03-05").unwrap(), expected);
        assert_eq!(parse_date("2024/03/05").unwrap(), expected);
        assert_eq!(parse_date("20240305").unwrap(), expected);
        assert_eq!(parse_date("2024-03-05 13:45:00").unwrap(), expected);
        assert!(parse_date("").is_err());
        assert!(parse_date("05.03.2024").is_err());
        assert!(parse_date("2024-02-30").is_err());
    }

    #[test]
    fn test_normalize_signed_amount() {
        let txn = normalize(&record("credit_card", "-¥128.50")).unwrap();
        assert_eq!(txn.amount(), dec("-128.50"));
        assert_eq!(txn.description(), "Coffee Shop");
        assert_eq!(txn.source(), &Source::CreditCard("cmb".into()));
    }

    #[test]
    fn test_normalize_flow_overrides_sign() {
        let mut r = record("digital_wallet", "128.50");
        r.flow = Some(Flow::Outflow);
        assert_eq!(normalize(&r).unwrap().amount(), dec("-128.50"));
        r.flow = Some(Flow::Inflow);
        r.amount = "-3.00".into();
        assert_eq!(normalize(&r).unwrap().amount(), dec("3.00"));
    }

    #[test]
    fn test_normalize_deposit_marker_is_inflow() {
        let txn = normalize(&record("credit_card", "存入 -300.00")).unwrap();
        assert_eq!(txn.amount(), dec("300.00"));
    }

    #[test]
    fn test_normalize_blank_external_ref_is_none() {
        let mut r = record("digital_wallet", "1");
        r.external_ref = Some("  ".into());
        assert_eq!(normalize(&r).unwrap().external_ref(), None);
        r.external_ref = Some("card-1234".into());
        assert_eq!(normalize(&r).unwrap().external_ref(), Some("card-1234"));
    }

    #[test]
    fn test_normalize_all_fails_whole_batch() {
        let mut bad = record("credit_card", "12.00");
        bad.date = String::new();
        let records = vec![record("credit_card", "1.00"), bad];
        let err = normalize_all(&records, SourceKind::CreditCard).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::InputContractViolation);
        assert!(err.to_string().contains("Record 1"));
    }

    #[test]
    fn test_normalize_all_rejects_wrong_source_kind() {
        let records = vec![record("digital_wallet", "1.00")];
        let err = normalize_all(&records, SourceKind::CreditCard).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::InputContractViolation);
    }

    #[test]
    fn test_normalize_unknown_source() {
        assert!(normalize(&record("cash", "1.00")).is_err());
    }

    #[test]
    fn test_parse_records_csv() {
        let csv_text = "source,institution,date,amount,description,account_ref,external_ref,flow\n\
            credit_card,cmb,2024-03-05,-128.50,UnionPay Merchant 1234,6222****1234,,\n\
            digital_wallet,wechat,2024-03-05 09:12:00,128.50,Coffee Shop Downtown,wx-01,card-1234,outflow\n";
        let records = parse_records(csv_text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].external_ref, None);
        assert_eq!(records[1].flow, Some(Flow::Outflow));
        let txn = normalize(&records[1]).unwrap();
        assert_eq!(txn.amount(), dec("-128.50"));
        assert_eq!(txn.external_ref(), Some("card-1234"));
    }
}
