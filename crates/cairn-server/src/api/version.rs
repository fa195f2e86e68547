//! GET /version

use crate::version;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub full_version: String,
    pub commit: &'static str,
    pub branch: &'static str,
    pub built: &'static str,
}

pub async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: version::VERSION,
        full_version: version::full_version(),
        commit: version::GIT_SHA,
        branch: version::GIT_BRANCH,
        built: version::BUILD_TIMESTAMP,
    })
}
