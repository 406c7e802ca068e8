use crate::args::CheckArgs;
use crate::commands::Out;
use crate::error::{Error, ErrorType, IntoResult};
use crate::reconcile::{reconcile, ReconciliationReport};
use crate::{utils, Result};

/// Reconciles two documents. Discrepancies are returned as a `ReconciliationDiscrepancy` error so
/// that the exit code reflects them.
pub async fn check(args: &CheckArgs) -> Result<Out<ReconciliationReport>> {
    let pre = utils::read(args.pre()).await.pub_result(ErrorType::Storage)?;
    let post = utils::read(args.post())
        .await
        .pub_result(ErrorType::Storage)?;
    let report = reconcile(&pre, &post);
    if !report.matched {
        return Err(Error::msg(
            ErrorType::ReconciliationDiscrepancy,
            report.summary(),
        ));
    }
    Ok(Out::new(report.summary(), report))
}
