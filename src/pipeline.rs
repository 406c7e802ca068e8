//! Sequences the stages of a run: merge, mask, transform, reconcile and unmask.
//!
//! Each stage is also callable on its own so that the CLI can run them one at a time. The mask
//! map is persisted before the masked document leaves the process, and it stays on disk until
//! the restored document has been written. A run that fails anywhere in between can be finished
//! later with [`unmask_stage`] and [`finish`].

use crate::error::{Error, ErrorType, IntoResult};
use crate::ledger::{self, RenderOptions};
use crate::mask::{self, MaskMap, UnmaskReport};
use crate::merge::{self, MergeStats};
use crate::model::SourceKind;
use crate::normalize::{self, RawRecord};
use crate::reconcile::{self, ReconciliationReport};
use crate::rules::FilterStats;
use crate::store::{Checkpoint, RunStore};
use crate::transform::Transform;
use crate::{Config, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A fresh run id: a v4 uuid without dashes.
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Reads and concatenates the records of several parser output files.
pub async fn read_all(paths: &[PathBuf]) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    for path in paths {
        let mut batch = normalize::read_records(path).await?;
        debug!("Read {} records from {}", batch.len(), path.display());
        records.append(&mut batch);
    }
    Ok(records)
}

/// The ledger produced by the merge stage.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Merged {
    #[serde(skip)]
    pub ledger: String,
    pub merge: MergeStats,
    pub filter: FilterStats,
}

/// Normalizes both batches, merges them, applies the configured filters and renders the ledger.
///
/// # Errors
/// Returns an `InputContractViolation` if any record is invalid or sits in the wrong batch.
pub fn merge_stage(
    config: &Config,
    credit_card: &[RawRecord],
    digital: &[RawRecord],
) -> Result<Merged> {
    let cards = normalize::normalize_all(credit_card, SourceKind::CreditCard)?;
    let wallets = normalize::normalize_all(digital, SourceKind::DigitalWallet)?;
    let output = merge::merge(&cards, &wallets, &config.merge_options())?;
    let stats = output.stats();
    let (kept, filter) = config.filters().apply(output.into_transactions());
    let options = RenderOptions {
        currency: config.currency().to_string(),
        header_comment: Some(format!("Merged ledger: {} transactions", kept.len())),
        include_source_comment: true,
    };
    let ledger = ledger::render(&kept, config.account_rules(), &options);
    Ok(Merged {
        ledger,
        merge: stats,
        filter,
    })
}

/// The result of the mask stage.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MaskStage {
    pub run_id: String,
    #[serde(skip)]
    pub masked: String,
    pub tokens: usize,
    pub map_path: PathBuf,
}

/// Masks `document`, verifies that nothing that reads as an amount is left, then persists the map
/// and the masked checkpoint.
///
/// # Errors
/// Returns a `MaskingConflict` if the run id is invalid or already in use, or if the redaction
/// check fails. Nothing is written in those cases.
pub async fn mask_stage(store: &RunStore, document: &str, run_id: &str) -> Result<MaskStage> {
    let masked = mask::mask(document, run_id)?;
    mask::check_redacted(&masked.text)?;
    let map_path = store.create_map(&masked.map).await?;
    store
        .save_checkpoint(run_id, Checkpoint::Masked, &masked.text)
        .await?;
    info!(
        "Masked run {run_id} with {} distinct tokens",
        masked.map.len()
    );
    Ok(MaskStage {
        run_id: run_id.to_string(),
        masked: masked.text,
        tokens: masked.map.len(),
        map_path,
    })
}

/// Hands the masked document to `transform` and saves whatever comes back as the transformed
/// checkpoint.
///
/// # Errors
/// Returns a `Transform` error if the transform fails or does not finish within `timeout`. The
/// map and the masked checkpoint are left in place.
pub async fn transform_stage(
    store: &RunStore,
    run_id: &str,
    masked: &str,
    transform: &dyn Transform,
    instructions: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    info!(
        "Sending run {run_id} to transform '{}' (timeout {}s)",
        transform.name(),
        timeout.as_secs()
    );
    let transformed = match tokio::time::timeout(timeout, transform.transform(masked, instructions))
        .await
    {
        Ok(res) => res.pub_result(ErrorType::Transform)?,
        Err(_) => {
            return Err(Error::msg(
                ErrorType::Transform,
                format!(
                    "Transform '{}' did not finish within {}s, run {run_id} can be retried with \
                    'reconcile unmask'",
                    transform.name(),
                    timeout.as_secs()
                ),
            ))
        }
    };
    store
        .save_checkpoint(run_id, Checkpoint::Transformed, &transformed)
        .await?;
    Ok(transformed)
}

/// The result of the unmask stage.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Unmasked {
    #[serde(skip)]
    pub document: String,
    pub reconciliation: ReconciliationReport,
    pub unmask: UnmaskReport,
    /// True when `force` overrode at least one discrepancy.
    pub forced: bool,
    /// Set by [`finish`] once the restored document is safely written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<PathBuf>,
}

/// Reconciles `post` against `pre` and restores the amounts in `post`. The map is left in place;
/// call [`finish`] after the restored document has been written.
///
/// # Errors
/// - `ReconciliationDiscrepancy` if the documents do not reconcile and `force` is false.
/// - `UnmaskMismatch` if `post` contains a token the map does not know, regardless of `force`.
pub fn unmask_stage(
    map: &MaskMap,
    pre: &str,
    post: &str,
    force: bool,
) -> Result<Unmasked> {
    let run_id = map.run_id();
    let reconciliation = reconcile::reconcile(pre, post);
    let forced = !reconciliation.matched;
    if forced {
        if !force {
            return Err(Error::msg(
                ErrorType::ReconciliationDiscrepancy,
                format!(
                    "{}\nThe mask map for run {run_id} was kept, rerun with --force to unmask \
                    anyway",
                    reconciliation.summary()
                ),
            ));
        }
        warn!(
            "Unmasking run {run_id} despite {} discrepancies",
            reconciliation.discrepancies.len()
        );
    }

    let (document, unmask) = mask::unmask(post, map)?;
    info!(
        "Restored {} amounts in run {run_id}, {} tokens unused",
        unmask.tokens_replaced, unmask.tokens_unused
    );
    Ok(Unmasked {
        document,
        reconciliation,
        unmask,
        forced,
        archived: None,
    })
}

/// Writes `document` to `output` (stdout when `None`) and only then archives the run's map and
/// drops its checkpoints. A failed write leaves the run untouched so that unmasking can be
/// retried.
pub async fn finish(
    store: &RunStore,
    run_id: &str,
    output: Option<&Path>,
    document: &str,
) -> Result<PathBuf> {
    write_output(output, document).await?;
    store.archive(run_id).await
}

/// Settings for a full run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: String,
    pub instructions: Option<String>,
    pub timeout: Duration,
    pub force: bool,
    /// Where the restored ledger goes, stdout when `None`.
    pub output: Option<PathBuf>,
}

/// What a full run did.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunReport {
    pub run_id: String,
    pub merge: MergeStats,
    pub filter: FilterStats,
    pub tokens: usize,
    pub reconciliation: ReconciliationReport,
    pub unmask: UnmaskReport,
    pub forced: bool,
    pub archived: PathBuf,
    #[serde(skip)]
    pub document: String,
}

/// Runs every stage in order and writes the restored ledger to `options.output`.
pub async fn run(
    config: &Config,
    transform: &dyn Transform,
    credit_card: &[RawRecord],
    digital: &[RawRecord],
    options: &RunOptions,
) -> Result<RunReport> {
    let store = config.store();
    let merged = merge_stage(config, credit_card, digital)?;
    let masked = mask_stage(&store, &merged.ledger, &options.run_id).await?;
    let transformed = transform_stage(
        &store,
        &options.run_id,
        &masked.masked,
        transform,
        options.instructions.as_deref(),
        options.timeout,
    )
    .await?;
    let map = store.load_map(&options.run_id).await?;
    let unmasked = unmask_stage(&map, &masked.masked, &transformed, options.force)?;
    let archived = finish(
        &store,
        &options.run_id,
        options.output.as_deref(),
        &unmasked.document,
    )
    .await?;
    Ok(RunReport {
        run_id: options.run_id.clone(),
        merge: merged.merge,
        filter: merged.filter,
        tokens: masked.tokens,
        reconciliation: unmasked.reconciliation,
        unmask: unmasked.unmask,
        forced: unmasked.forced,
        archived,
        document: unmasked.document,
    })
}

/// Writes `document` to `output` when given, otherwise to stdout.
pub async fn write_output(output: Option<&Path>, document: &str) -> Result<()> {
    match output {
        Some(path) => crate::utils::write(path, document)
            .await
            .pub_result(ErrorType::Storage),
        None => {
            print!("{document}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Res;
    use crate::test::TestEnv;
    use crate::transform::IdentityTransform;

    fn record(source: &str, institution: &str, amount: &str, description: &str) -> RawRecord {
        RawRecord {
            source: source.into(),
            institution: institution.into(),
            date: "2024-03-05".into(),
            amount: amount.into(),
            description: description.into(),
            account_ref: String::new(),
            external_ref: None,
            flow: None,
        }
    }

    fn cards() -> Vec<RawRecord> {
        vec![
            RawRecord {
                account_ref: "6222****1234".into(),
                ..record("credit_card", "cmb", "-128.50", "UnionPay Merchant 1234")
            },
            RawRecord {
                date: "2024-03-06".into(),
                ..record("credit_card", "cmb", "-42.00", "Bookstore")
            },
        ]
    }

    fn wallets() -> Vec<RawRecord> {
        vec![
            RawRecord {
                external_ref: Some("card-1234".into()),
                ..record("digital_wallet", "alipay", "-128.50", "Coffee Shop Downtown")
            },
            RawRecord {
                date: "2024-03-07".into(),
                ..record("digital_wallet", "wechat", "-9.90", "Metro")
            },
        ]
    }

    fn options(run_id: &str) -> RunOptions {
        RunOptions {
            run_id: run_id.into(),
            instructions: None,
            timeout: Duration::from_secs(5),
            force: false,
            output: None,
        }
    }

    /// Rewrites narration, leaves postings alone.
    struct Rename;

    #[async_trait::async_trait]
    impl Transform for Rename {
        fn name(&self) -> &str {
            "rename"
        }

        async fn transform(&self, document: &str, _: Option<&str>) -> Res<String> {
            Ok(document.replace("Coffee Shop Downtown", "Coffee"))
        }
    }

    /// Deletes the first posting line that carries a token.
    struct DropPosting;

    #[async_trait::async_trait]
    impl Transform for DropPosting {
        fn name(&self) -> &str {
            "drop"
        }

        async fn transform(&self, document: &str, _: Option<&str>) -> Res<String> {
            let mut dropped = false;
            let kept: Vec<&str> = document
                .lines()
                .filter(|line| {
                    if !dropped && line.starts_with("  ") && line.contains("__AMT_") {
                        dropped = true;
                        return false;
                    }
                    true
                })
                .collect();
            Ok(format!("{}\n", kept.join("\n")))
        }
    }

    struct Fail;

    #[async_trait::async_trait]
    impl Transform for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        async fn transform(&self, _: &str, _: Option<&str>) -> Res<String> {
            anyhow::bail!("provider unavailable")
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Transform for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn transform(&self, document: &str, _: Option<&str>) -> Res<String> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(document.to_string())
        }
    }

    /// Appends a comment with a token that was never issued.
    struct Invent;

    #[async_trait::async_trait]
    impl Transform for Invent {
        fn name(&self) -> &str {
            "invent"
        }

        async fn transform(&self, document: &str, _: Option<&str>) -> Res<String> {
            Ok(format!("{document}; total __AMT_invent_999999__\n"))
        }
    }

    #[tokio::test]
    async fn test_merge_stage() {
        let env = TestEnv::new().await;
        let merged = merge_stage(&env.config(), &cards(), &wallets()).unwrap();
        assert_eq!(merged.merge.total, 3);
        assert_eq!(merged.merge.correlated, 1);
        assert!(merged.ledger.contains("2024-03-05 * \"Coffee Shop Downtown\""));
        assert!(merged.ledger.contains("Liabilities:CreditCard:Cmb  -128.50 CNY"));
        assert!(!merged.ledger.contains("UnionPay"));
    }

    #[tokio::test]
    async fn test_merge_stage_rejects_bad_record() {
        let env = TestEnv::new().await;
        let mut bad = cards();
        bad[1].date = "yesterday".into();
        let err = merge_stage(&env.config(), &bad, &wallets()).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::InputContractViolation);
    }

    #[tokio::test]
    async fn test_run_identity() {
        let env = TestEnv::new().await;
        let config = env.config();
        let store = config.store();
        let merged = merge_stage(&config, &cards(), &wallets()).unwrap();

        let output = env.dir().join("final.beancount");
        let opts = RunOptions {
            output: Some(output.clone()),
            ..options("r1")
        };
        let report = run(&config, &IdentityTransform, &cards(), &wallets(), &opts)
            .await
            .unwrap();

        assert_eq!(report.document, merged.ledger);
        assert_eq!(crate::utils::read(&output).await.unwrap(), merged.ledger);
        assert!(report.reconciliation.matched);
        assert_eq!(report.tokens, 3);
        assert_eq!(report.unmask.tokens_unused, 0);
        assert!(!report.forced);
        assert!(report.archived.is_file());
        assert!(!store.map_path("r1").exists());
        assert!(!store.checkpoint_path("r1", Checkpoint::Masked).exists());
    }

    #[tokio::test]
    async fn test_run_with_rewritten_narration() {
        let env = TestEnv::new().await;
        let report = run(&env.config(), &Rename, &cards(), &wallets(), &options("r2"))
            .await
            .unwrap();
        assert!(report.document.contains("2024-03-05 * \"Coffee\""));
        assert!(report.document.contains("-128.50 CNY"));
    }

    #[tokio::test]
    async fn test_run_dropped_posting_blocks_unmask() {
        let env = TestEnv::new().await;
        let config = env.config();
        let store = config.store();
        let err = run(&config, &DropPosting, &cards(), &wallets(), &options("r3"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::ReconciliationDiscrepancy);
        assert!(store.map_path("r3").is_file());
        assert!(store.checkpoint_path("r3", Checkpoint::Masked).is_file());
        assert!(store.checkpoint_path("r3", Checkpoint::Transformed).is_file());

        // The operator may override.
        let map = store.load_map("r3").await.unwrap();
        let pre = store.load_checkpoint("r3", Checkpoint::Masked).await.unwrap();
        let post = store
            .load_checkpoint("r3", Checkpoint::Transformed)
            .await
            .unwrap();
        let unmasked = unmask_stage(&map, &pre, &post, true).unwrap();
        assert!(unmasked.forced);
        assert!(!unmasked.reconciliation.matched);
        assert_eq!(unmasked.unmask.tokens_unused, 1);
        assert!(unmasked.archived.is_none());
        assert!(store.map_path("r3").is_file());

        let output = env.dir().join("forced.beancount");
        let archived = finish(&store, "r3", Some(&output), &unmasked.document)
            .await
            .unwrap();
        assert!(archived.is_file());
        assert!(!store.map_path("r3").exists());
    }

    #[tokio::test]
    async fn test_failed_transform_keeps_map_for_retry() {
        let env = TestEnv::new().await;
        let config = env.config();
        let store = config.store();
        let err = run(&config, &Fail, &cards(), &wallets(), &options("r4"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Transform);
        assert!(err.to_string().contains("provider unavailable"));
        assert!(store.map_path("r4").is_file());

        let map = store.load_map("r4").await.unwrap();
        let pre = store.load_checkpoint("r4", Checkpoint::Masked).await.unwrap();
        let unmasked = unmask_stage(&map, &pre, &pre, false).unwrap();
        assert!(unmasked.document.contains("-128.50 CNY"));
    }

    #[tokio::test]
    async fn test_transform_timeout() {
        let env = TestEnv::new().await;
        let config = env.config();
        let opts = RunOptions {
            timeout: Duration::from_millis(50),
            ..options("r5")
        };
        let err = run(&config, &Slow, &cards(), &wallets(), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Transform);
        assert!(config.store().map_path("r5").is_file());
    }

    #[tokio::test]
    async fn test_invented_token_is_never_guessed() {
        let env = TestEnv::new().await;
        let config = env.config();
        let opts = RunOptions {
            force: true,
            ..options("invent")
        };
        let err = run(&config, &Invent, &cards(), &wallets(), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::UnmaskMismatch);
        assert!(config.store().map_path("invent").is_file());
    }

    #[tokio::test]
    async fn test_run_id_reuse_is_conflict() {
        let env = TestEnv::new().await;
        let config = env.config();
        let store = config.store();
        mask_stage(&store, "x 1.00 CNY\n", "same").await.unwrap();
        let err = run(&config, &IdentityTransform, &cards(), &wallets(), &options("same"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::MaskingConflict);
    }

    #[tokio::test]
    async fn test_unwritable_output_keeps_map() {
        let env = TestEnv::new().await;
        let config = env.config();
        let store = config.store();
        let opts = RunOptions {
            output: Some(env.dir().join("missing").join("final.beancount")),
            ..options("r6")
        };
        let err = run(&config, &IdentityTransform, &cards(), &wallets(), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Storage);
        assert!(store.map_path("r6").is_file());
        assert!(store.checkpoint_path("r6", Checkpoint::Masked).is_file());
        let mut archive = tokio::fs::read_dir(config.archive()).await.unwrap();
        assert!(archive.next_entry().await.unwrap().is_none());

        let map = store.load_map("r6").await.unwrap();
        let pre = store.load_checkpoint("r6", Checkpoint::Masked).await.unwrap();
        let unmasked = unmask_stage(&map, &pre, &pre, false).unwrap();
        let output = env.dir().join("final.beancount");
        finish(&store, "r6", Some(&output), &unmasked.document)
            .await
            .unwrap();
        assert!(crate::utils::read(&output).await.unwrap().contains("-128.50 CNY"));
        assert!(!store.map_path("r6").exists());
    }

    #[test]
    fn test_new_run_id() {
        let id = new_run_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
