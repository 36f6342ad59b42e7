//! Client for the remote fuzzing server: artifact upload and run start.
//!
//! The wire protocol is deliberately small; everything beyond these two
//! calls lives on the server side.

use std::path::Path;

use serde::Deserialize;

use crate::{CifuzzError, CifuzzResult};

/// Environment variable holding the API access token.
pub const API_TOKEN_ENV_VAR: &str = "CIFUZZ_API_TOKEN";

const UPLOAD_FIELD_NAME: &str = "fuzzing-artifacts";

pub struct ApiClient {
    server: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactUploadResponse {
    #[serde(rename = "display-name")]
    pub display_name: String,
    #[serde(rename = "resource-name")]
    pub resource_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRunResponse {
    pub name: String,
}

impl ApiClient {
    pub fn new(server: &str) -> ApiClient {
        ApiClient {
            server: server.trim_end_matches('/').to_string(),
        }
    }

    /// Uploads a bundle via multipart POST and returns its resource name.
    pub fn upload_bundle(
        &self,
        project: &str,
        bundle: &Path,
        token: &str,
    ) -> CifuzzResult<ArtifactUploadResponse> {
        let url = format!("{}/v1/projects/{project}/artifacts", self.server);
        let filename = bundle
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fuzz_tests.tar.gz".to_string());
        let content = std::fs::read(bundle)?;
        let (body, content_type) = multipart_body(UPLOAD_FIELD_NAME, &filename, &content);

        let response = ureq::post(&url)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Content-Type", &content_type)
            .send_bytes(&body)
            .map_err(request_error)?;
        response
            .into_json()
            .map_err(|err| CifuzzError::Api(format!("invalid artifact upload response: {err}")))
    }

    /// Starts a remote run on a previously uploaded artifact. Returns the
    /// name of the started run.
    pub fn start_remote_run(
        &self,
        project: &str,
        artifact_resource_name: &str,
        token: &str,
    ) -> CifuzzResult<String> {
        let url = format!(
            "{}/v1/projects/{project}/findings:startRemoteRun",
            self.server
        );
        let response = ureq::post(&url)
            .set("Authorization", &format!("Bearer {token}"))
            .send_json(ureq::json!({ "artifact": artifact_resource_name }))
            .map_err(request_error)?;
        let run: RemoteRunResponse = response
            .into_json()
            .map_err(|err| CifuzzError::Api(format!("invalid remote run response: {err}")))?;
        Ok(run.name)
    }
}

fn request_error(err: ureq::Error) -> CifuzzError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            CifuzzError::Api(format!("the server responded with {code}: {body}"))
        }
        ureq::Error::Transport(transport) => {
            CifuzzError::Api(format!("request failed: {transport}"))
        }
    }
}

/// Builds a single-file `multipart/form-data` body.
fn multipart_body(field: &str, filename: &str, content: &[u8]) -> (Vec<u8>, String) {
    let boundary = format!("cifuzz-{}", blake3::hash(content).to_hex());
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    let content_type = format!("multipart/form-data; boundary={boundary}");
    (body, content_type)
}
