//! Artifact storage interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Part;

/// Location of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub filename: String,
}

/// Versioned artifact storage keyed by `(app, user, session, filename, version)`.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    /// Store a new version and return its version number.
    async fn save_artifact(&self, key: &ArtifactKey, artifact: Part) -> Result<i64>;

    /// Load a version, or the latest when `version` is `None`.
    async fn load_artifact(&self, key: &ArtifactKey, version: Option<i64>) -> Result<Option<Part>>;

    async fn list_artifact_keys(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<String>>;

    async fn delete_artifact(&self, key: &ArtifactKey) -> Result<()>;

    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<i64>>;
}
