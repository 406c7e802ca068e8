use crate::args::RunArgs;
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::pipeline::{self, RunOptions, RunReport};
use crate::transform::{self, Mode};
use crate::{utils, Config, Result};
use std::path::Path;
use std::time::Duration;

/// Runs the whole pipeline and writes the final ledger.
pub async fn run(config: Config, mode: Mode, args: &RunArgs) -> Result<Out<RunReport>> {
    let transform = transform::transform(&config, mode)?;
    let credit_card = pipeline::read_all(args.inputs().credit_card()).await?;
    let digital = pipeline::read_all(args.inputs().digital()).await?;
    let instructions = match args.instructions() {
        Some(path) => Some(utils::read(path).await.pub_result(ErrorType::Storage)?),
        None => None,
    };
    let options = RunOptions {
        run_id: pipeline::new_run_id(),
        instructions,
        timeout: args
            .timeout()
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.transform_timeout()),
        force: args.force(),
        output: args.output().map(Path::to_path_buf),
    };

    let report = pipeline::run(
        &config,
        transform.as_ref(),
        &credit_card,
        &digital,
        &options,
    )
    .await?;
    let message = format!(
        "Run {} finished: {} transactions, {} amounts restored{}",
        report.run_id,
        report.reconciliation.post_count,
        report.unmask.tokens_replaced,
        if report.forced {
            " despite discrepancies"
        } else {
            ""
        }
    );
    Ok(Out::new(message, report))
}
