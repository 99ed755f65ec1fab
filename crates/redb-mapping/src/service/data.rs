//! Data movement and schema deployment RPCs.

use tokio::sync::mpsc;

use super::MappingService;
use crate::core::Scope;
use crate::deploy::{CommitDeployment, DeployTarget};
use crate::error::Result;
use crate::pipeline::{CopyProgress, CopyRequest, StreamProgress, TransformMode, TransformSummary};

impl MappingService {
    /// `CopyMappingData`: progress messages until a terminal status.
    pub async fn copy_mapping_data(
        &self,
        scope: &Scope,
        mapping_id: &str,
        request: CopyRequest,
    ) -> Result<mpsc::Receiver<CopyProgress>> {
        self.tracked("CopyMappingData", async {
            self.require_workspace(scope).await?;
            self.pipeline
                .copy_mapping_data(scope, mapping_id, request)
                .await
        })
        .await
    }

    /// `TransformData`: one summary per source/target table pair.
    pub async fn transform_data(
        &self,
        scope: &Scope,
        mapping_id: &str,
        mode: TransformMode,
    ) -> Result<TransformSummary> {
        self.tracked("TransformData", async {
            self.require_workspace(scope).await?;
            self.pipeline.transform_data(scope, mapping_id, mode).await
        })
        .await
    }

    pub async fn transform_data_stream(
        &self,
        scope: &Scope,
        mapping_id: &str,
        mode: TransformMode,
    ) -> Result<mpsc::Receiver<StreamProgress>> {
        self.tracked("TransformDataStream", async {
            self.require_workspace(scope).await?;
            self.pipeline
                .transform_data_stream(scope, mapping_id, mode)
                .await
        })
        .await
    }

    /// `DeployCommitSchema` into a new or an existing database.
    pub async fn deploy_commit_schema(
        &self,
        scope: &Scope,
        repo: &str,
        branch: &str,
        commit: &str,
        target: DeployTarget,
    ) -> Result<CommitDeployment> {
        self.tracked("DeployCommitSchema", async {
            self.require_workspace(scope).await?;
            self.deployer
                .deploy_commit_schema(scope, repo, branch, commit, target)
                .await
        })
        .await
    }
}
