use crate::commands::Out;
use crate::{Config, Result};
use std::path::Path;

/// Creates the data directory, its subdirectories and an initial `config.json` file with default
/// settings.
///
/// # Arguments
/// - `reconcile_home` - The directory that will be the root of the data directory, e.g.
///   `$HOME/reconcile`
///
/// # Errors
/// - Returns an error if any file operations fail.
pub async fn init(reconcile_home: &Path) -> Result<Out<()>> {
    let config = Config::create(reconcile_home).await?;
    Ok(format!(
        "Successfully created the reconcile directory and config at {}",
        config.root().display()
    )
    .into())
}
