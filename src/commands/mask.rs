use crate::args::MaskArgs;
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::pipeline::{self, MaskStage};
use crate::{utils, Config, Result};

/// Masks a document and saves the map under the run id, which is generated if not given.
pub async fn mask(config: Config, args: &MaskArgs) -> Result<Out<MaskStage>> {
    let document = utils::read(args.input())
        .await
        .pub_result(ErrorType::Storage)?;
    let run_id = args
        .run_id()
        .map(String::from)
        .unwrap_or_else(pipeline::new_run_id);
    let stage = pipeline::mask_stage(&config.store(), &document, &run_id).await?;
    pipeline::write_output(args.output(), &stage.masked).await?;
    let message = format!(
        "Masked run {run_id} with {} tokens, the map is at {}",
        stage.tokens,
        stage.map_path.display()
    );
    Ok(Out::new(message, stage))
}
