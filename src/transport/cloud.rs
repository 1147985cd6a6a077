use std::path::Path;

use crate::config::{AwsCredentials, GcpCredentials};
use crate::container::LocalArchive;
use crate::domain::CostTier;
use crate::error::KiraError;
use crate::resolver::CandidateLocation;
use crate::transport::AttemptContext;
use crate::transport::process::ToolCommand;

fn single_locator<'a>(
    location: &'a CandidateLocation,
    scheme: &str,
) -> Result<&'a str, KiraError> {
    let locator = location
        .files
        .first()
        .map(|file| file.locator.as_str())
        .ok_or_else(|| KiraError::download("no object in resolved location", false))?;
    if !locator.starts_with(scheme) {
        return Err(KiraError::download(
            format!("expected a {scheme} locator, got {locator}"),
            false,
        ));
    }
    Ok(locator)
}

/// Builds the `aws s3 cp` invocation. Free objects are fetched unsigned unless
/// keys were supplied; paid objects are fetched as requester.
pub fn aws_cp_command(
    aws: &Path,
    credentials: Option<&AwsCredentials>,
    locator: &str,
    tier: CostTier,
    dest: &Path,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(aws).args(["s3", "cp", "--only-show-errors"]);
    match (tier, credentials) {
        (CostTier::Paid, _) => cmd = cmd.args(["--request-payer", "requester"]),
        (CostTier::Free, None) => cmd = cmd.arg("--no-sign-request"),
        (CostTier::Free, Some(_)) => {}
    }
    if let Some(credentials) = credentials {
        cmd = cmd
            .env("AWS_ACCESS_KEY_ID", &credentials.key_id)
            .env("AWS_SECRET_ACCESS_KEY", &credentials.secret);
    }
    cmd.arg(locator).arg(dest)
}

pub fn aws_cp(
    aws: &Path,
    credentials: Option<&AwsCredentials>,
    location: &CandidateLocation,
    ctx: &AttemptContext<'_>,
) -> Result<LocalArchive, KiraError> {
    let locator = single_locator(location, "s3://")?;
    let dest = ctx.sra_destination();
    ctx.run_tool(&aws_cp_command(aws, credentials, locator, location.cost_tier, &dest))?;
    Ok(LocalArchive::Sra(dest))
}

pub fn gcp_cp(
    gsutil: &Path,
    gcloud: Option<&Path>,
    credentials: &GcpCredentials,
    location: &CandidateLocation,
    ctx: &AttemptContext<'_>,
) -> Result<LocalArchive, KiraError> {
    let locator = single_locator(location, "gs://")?;
    if let Some(key_file) = &credentials.key_file {
        let gcloud = gcloud.ok_or_else(|| KiraError::MissingTool("gcloud".to_string()))?;
        ctx.run_tool(
            &ToolCommand::new(gcloud)
                .args(["auth", "activate-service-account", "--key-file"])
                .arg(key_file),
        )?;
    }
    let project = match &credentials.project {
        Some(project) => project.clone(),
        None => default_gcp_project(gcloud, ctx)?,
    };
    let dest = ctx.sra_destination();
    ctx.run_tool(
        &ToolCommand::new(gsutil)
            .args(["-q", "-u", project.as_str(), "cp"])
            .arg(locator)
            .arg(&dest),
    )?;
    Ok(LocalArchive::Sra(dest))
}

/// Requester-pays needs a billing project; fall back to gcloud's active one.
fn default_gcp_project(
    gcloud: Option<&Path>,
    ctx: &AttemptContext<'_>,
) -> Result<String, KiraError> {
    let gcloud = gcloud.ok_or_else(|| {
        KiraError::download("no GCP project given and gcloud is not installed", false)
    })?;
    let output =
        ctx.run_tool(&ToolCommand::new(gcloud).args(["config", "get-value", "project"]))?;
    let project = output.trim();
    if project.is_empty() || project == "(unset)" {
        return Err(KiraError::download(
            "no GCP project given and gcloud has none configured",
            false,
        ));
    }
    Ok(project.to_string())
}
