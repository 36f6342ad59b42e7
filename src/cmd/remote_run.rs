//! The `remote-run` command: upload a bundle and start a remote run.

use std::path::PathBuf;

use crate::api::{ApiClient, API_TOKEN_ENV_VAR};
use crate::{CifuzzError, CifuzzResult};

#[derive(Debug, Clone)]
pub struct RemoteRunOptions {
    pub bundle: PathBuf,
    pub project: String,
    pub server: String,
}

pub fn remote_run(opts: RemoteRunOptions) -> CifuzzResult<()> {
    let token = match std::env::var(API_TOKEN_ENV_VAR) {
        Ok(token) if !token.is_empty() => token,
        _ => {
            return Err(CifuzzError::Usage(format!(
                "no API access token found; set {API_TOKEN_ENV_VAR} to authenticate with {}",
                opts.server
            )));
        }
    };
    if !opts.bundle.is_file() {
        return Err(CifuzzError::Usage(format!(
            "bundle {} does not exist",
            opts.bundle.display()
        )));
    }

    let client = ApiClient::new(&opts.server);
    tracing::info!("uploading {} to {}", opts.bundle.display(), opts.server);
    let artifact = client.upload_bundle(&opts.project, &opts.bundle, &token)?;
    tracing::info!("uploaded artifact {}", artifact.display_name);

    let run = client.start_remote_run(&opts.project, &artifact.resource_name, &token)?;
    tracing::info!("started remote run {run}");
    Ok(())
}
