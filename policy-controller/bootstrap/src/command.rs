use crate::{seed, PolicyDocument, DEFAULT_POLICY_YAML};
use anyhow::{bail, Context, Result};
use rbac_policy_core::PolicyStore;
use std::{io, path::Path};
use tracing::info;

/// The command that writes the default policy document to disk.
pub const CREATE_BOOTSTRAP_POLICY_FILE_COMMAND: &str =
    "rbac-policy-controller create-bootstrap-policy-file";

/// Seeds `store` from the policy document at `path`.
///
/// When the file does not exist, the error names `command_name` so an operator knows how to
/// produce it.
pub async fn overwrite_bootstrap_policy<S, W>(
    store: &S,
    path: &Path,
    command_name: &str,
    overwrite: bool,
    out: &mut W,
) -> Result<()>
where
    S: PolicyStore + ?Sized,
    W: io::Write + Send,
{
    let yaml = match tokio::fs::read_to_string(path).await {
        Ok(yaml) => yaml,
        Err(error) if error.kind() == io::ErrorKind::NotFound => bail!(
            "bootstrap policy file {} does not exist; create it with `{command_name} --filename={}`",
            path.display(),
            path.display(),
        ),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read bootstrap policy {}", path.display()))
        }
    };

    let doc = PolicyDocument::from_yaml(&yaml)
        .with_context(|| format!("failed to parse bootstrap policy {}", path.display()))?;
    doc.validate()
        .with_context(|| format!("invalid bootstrap policy {}", path.display()))?;

    let written = seed(store, &doc, overwrite)
        .await
        .context("failed to seed bootstrap policy")?;
    if written {
        writeln!(out, "Wrote {} bootstrap policy records", doc.len())?;
    } else {
        writeln!(out, "Bootstrap policy already present, nothing written")?;
    }
    Ok(())
}

/// Writes the default policy document to `path`.
///
/// An existing file is kept unless `overwrite` is set. Returns whether the file was written.
pub async fn create_bootstrap_policy_file<W>(
    path: &Path,
    overwrite: bool,
    out: &mut W,
) -> Result<bool>
where
    W: io::Write + Send,
{
    let exists = tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if exists && !overwrite {
        info!(path = %path.display(), "Keeping existing bootstrap policy file");
        writeln!(
            out,
            "Keeping existing bootstrap policy file at {}",
            path.display()
        )?;
        return Ok(false);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, DEFAULT_POLICY_YAML)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

    info!(path = %path.display(), "Generated bootstrap policy file");
    writeln!(
        out,
        "Generated new bootstrap policy file at {}",
        path.display()
    )?;
    Ok(true)
}
