use std::path::Path;

use crate::container::LocalArchive;
use crate::error::KiraError;
use crate::transport::AttemptContext;
use crate::transport::process::ToolCommand;

/// Downloads through the SRA Toolkit, which resolves the run itself.
pub fn prefetch(prefetch: &Path, ctx: &AttemptContext<'_>) -> Result<LocalArchive, KiraError> {
    let dest = ctx.sra_destination();
    let command = ToolCommand::new(prefetch)
        .arg("--output-file")
        .arg(&dest)
        .arg(ctx.accession.as_str())
        .current_dir(ctx.work_dir);
    ctx.run_tool(&command)?;
    if !dest.is_file() {
        return Err(KiraError::download(
            format!("prefetch did not produce {}", dest.display()),
            false,
        ));
    }
    Ok(LocalArchive::Sra(dest))
}
