use crate::args::MergeArgs;
use crate::commands::Out;
use crate::pipeline::{self, Merged};
use crate::{Config, Result};

/// Reads the input files, merges them and writes the ledger.
pub async fn merge(config: Config, args: &MergeArgs) -> Result<Out<Merged>> {
    let credit_card = pipeline::read_all(args.inputs().credit_card()).await?;
    let digital = pipeline::read_all(args.inputs().digital()).await?;
    let merged = pipeline::merge_stage(&config, &credit_card, &digital)?;
    pipeline::write_output(args.output(), &merged.ledger).await?;

    let stats = merged.merge;
    let message = format!(
        "Merged {} credit-card and {} digital-wallet records into {} transactions ({} matched, \
        {} ambiguous, {} filtered out)",
        stats.credit_card_in,
        stats.digital_in,
        merged.filter.kept,
        stats.correlated + stats.fallback,
        stats.ambiguous,
        merged.filter.skipped_by_keyword + merged.filter.skipped_by_amount,
    );
    Ok(Out::new(message, merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Inputs;
    use crate::test::TestEnv;
    use crate::utils;

    #[tokio::test]
    async fn test_merge_to_file() {
        let env = TestEnv::new().await;
        let (cards, wallets) = env.write_inputs().await;
        let output = env.dir().join("ledger.beancount");
        let args = MergeArgs::new(
            Inputs::new(vec![cards], vec![wallets]),
            Some(output.clone()),
        );

        let out = merge(env.config(), &args).await.unwrap();
        assert!(out.message().contains("into 3 transactions (1 matched"));

        let ledger = utils::read(&output).await.unwrap();
        assert!(ledger.contains("2024-03-05 * \"Coffee Shop Downtown\""));
        assert!(ledger.contains("Liabilities:CreditCard:Cmb  -1042.00 CNY"));
        assert!(ledger.contains("Assets:DigitalWallet:Wechat  -9.90 CNY"));
    }

    #[tokio::test]
    async fn test_merge_missing_file() {
        let env = TestEnv::new().await;
        let args = MergeArgs::new(
            Inputs::new(vec![env.dir().join("nope.csv")], Vec::new()),
            None,
        );
        assert!(merge(env.config(), &args).await.is_err());
    }
}
