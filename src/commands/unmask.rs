use crate::args::UnmaskArgs;
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::pipeline::{self, Unmasked};
use crate::store::Checkpoint;
use crate::{utils, Config, Result};

/// Checks a transformed document against the masked one, restores its amounts and archives the
/// run. The masked document is read from `--pre` or from the run's masked checkpoint.
pub async fn unmask(config: Config, args: &UnmaskArgs) -> Result<Out<Unmasked>> {
    let store = config.store();
    let run_id = args.run_id();
    let map = store.load_map(run_id).await?;
    let post = utils::read(args.input())
        .await
        .pub_result(ErrorType::Storage)?;
    let pre = match args.pre() {
        Some(path) => utils::read(path).await.pub_result(ErrorType::Storage)?,
        None => store.load_checkpoint(run_id, Checkpoint::Masked).await?,
    };
    store
        .save_checkpoint(run_id, Checkpoint::Transformed, &post)
        .await?;

    let mut unmasked = pipeline::unmask_stage(&map, &pre, &post, args.force())?;
    let archived =
        pipeline::finish(&store, run_id, args.output(), &unmasked.document).await?;
    let message = format!(
        "Restored {} amounts in run {run_id}{}, the map was archived to {}",
        unmasked.unmask.tokens_replaced,
        if unmasked.forced {
            " despite discrepancies"
        } else {
            ""
        },
        archived.display()
    );
    unmasked.archived = Some(archived);
    Ok(Out::new(message, unmasked))
}
