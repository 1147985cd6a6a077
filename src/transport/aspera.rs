use std::path::Path;

use crate::container::LocalArchive;
use crate::error::KiraError;
use crate::resolver::CandidateLocation;
use crate::transport::AttemptContext;
use crate::transport::process::ToolCommand;

const ENA_ASPERA_USER: &str = "era-fasp";

pub fn ascp_command(
    ascp: &Path,
    ssh_key: &Path,
    extra_args: &[String],
    locator: &str,
    dest_dir: &Path,
) -> ToolCommand {
    ToolCommand::new(ascp)
        .args(["-QT", "-l", "300m", "-P", "33001", "-i"])
        .arg(ssh_key)
        .args(extra_args)
        .arg(format!("{ENA_ASPERA_USER}@{locator}"))
        .arg(dest_dir)
}

/// Fetches every ENA FASTQ file of the run over Aspera into the work dir.
pub fn ascp(
    ascp: &Path,
    ssh_key: &Path,
    extra_args: &[String],
    location: &CandidateLocation,
    ctx: &AttemptContext<'_>,
) -> Result<LocalArchive, KiraError> {
    if !ssh_key.is_file() {
        return Err(KiraError::download(
            format!("aspera ssh key not found at {}", ssh_key.display()),
            false,
        ));
    }
    if location.files.is_empty() {
        return Err(KiraError::download("ENA lists no FASTQ files", false));
    }
    let mut paths = Vec::with_capacity(location.files.len());
    for file in &location.files {
        ctx.run_tool(&ascp_command(ascp, ssh_key, extra_args, &file.locator, ctx.work_dir))?;
        let dest = ctx.work_dir.join(file.file_name());
        if !dest.is_file() {
            return Err(KiraError::download(
                format!("ascp did not produce {}", dest.display()),
                true,
            ));
        }
        paths.push(dest);
    }
    Ok(LocalArchive::PresplitFastqGz(paths))
}
