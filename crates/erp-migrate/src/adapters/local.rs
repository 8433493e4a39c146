//! File-backed runtime wiring the bundled adapters together from a
//! [`Config`].

use std::sync::Arc;
use tracing::info;

use super::{JsonFileConnector, MemoryTargetStore};
use crate::config::Config;
use crate::control::ControlPlane;
use crate::detect::DetectorRegistry;
use crate::error::Result;
use crate::gates::PreflightGateChain;
use crate::orchestrator::Orchestrator;
use crate::pipeline::PipelineEngine;
use crate::rollback::RollbackEngine;
use crate::state::{FileJobStore, JobStore};
use crate::worker::{RetryPolicy, TokenBucket, Worker};

/// Legacy fixture, target file and state file opened from a config.
pub struct LocalRuntime {
    config: Config,
    connector: Arc<JsonFileConnector>,
    target: Arc<MemoryTargetStore>,
    jobs: Arc<FileJobStore>,
}

impl LocalRuntime {
    pub fn open(config: Config) -> Result<Self> {
        let connector = Arc::new(JsonFileConnector::open(&config.source.path)?);
        let target = Arc::new(MemoryTargetStore::open(&config.target.path)?);
        let jobs = Arc::new(FileJobStore::open(&config.state.path, config.state.hmac_key.clone())?);
        info!(
            "Opened local runtime: source {:?}, target {:?}, state {:?}",
            config.source.path, config.target.path, config.state.path
        );
        Ok(Self {
            config,
            connector,
            target,
            jobs,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target(&self) -> &Arc<MemoryTargetStore> {
        &self.target
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }

    fn engine(&self) -> PipelineEngine {
        let mut engine = PipelineEngine::new(
            self.connector.clone(),
            self.target.clone(),
            self.target.clone(),
            self.jobs.clone(),
            DetectorRegistry::with_builtins(),
        )
        .with_config(self.config.pipeline_config());
        if let Some(rate) = self.config.migration.pages_per_second {
            engine = engine.with_rate_limiter(Arc::new(TokenBucket::per_second(rate)));
        }
        engine
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let migration = &self.config.migration;
        Orchestrator::new(Arc::new(self.engine()))
            .with_preflight(PreflightGateChain::standard(
                migration.max_null_rate,
                migration.max_transform_error_rate,
            ))
            .with_preflight_overrides(migration.preflight_overrides.clone())
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            Arc::new(self.orchestrator()),
            self.config.migration.get_max_concurrent_jobs(),
        )
        .with_retry_policy(RetryPolicy::from(&self.config.migration.retry))
    }

    pub fn rollback_engine(&self) -> RollbackEngine {
        RollbackEngine::new(self.jobs.clone(), self.target.clone())
    }

    pub fn control_plane(&self) -> ControlPlane {
        ControlPlane::new(self.jobs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobStatus;
    use tokio_util::sync::CancellationToken;

    fn write_config(dir: &std::path::Path) -> Config {
        std::fs::write(
            dir.join("legacy.json"),
            r#"{"tables":[{"name":"legacy_contacts","rows":[
                {"id":1,"full_name":"Jon Smith","email_addr":"JON@X.COM"},
                {"id":2,"full_name":"Ann Lee","email_addr":"ann@y.org"}
            ]}]}"#,
        )
        .unwrap();
        let yaml = format!(
            r#"
source:
  path: {dir}/legacy.json
target:
  path: {dir}/target.json
state:
  path: {dir}/state.json
  hmac_key: secret
migration:
  max_concurrent_jobs: 1
entities:
  - entity_type: contacts
    table: legacy_contacts
    fields:
      - {{ source: full_name, target: name }}
      - {{ source: email_addr, target: email, data_type: email }}
"#,
            dir = dir.display()
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_run_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());

        let runtime = LocalRuntime::open(config.clone()).unwrap();
        let worker = runtime.worker();
        for job in config.jobs("r1", None, false).unwrap() {
            worker.submit(job).await;
        }
        let reports = worker.run_until_idle(&CancellationToken::new()).await;
        assert_eq!(reports[0].status, JobStatus::Completed);
        assert_eq!(runtime.target().records("contacts").await.len(), 2);

        let reopened = LocalRuntime::open(config).unwrap();
        assert_eq!(reopened.target().records("contacts").await.len(), 2);
        let summary = reopened.control_plane().job_summary("r1-contacts").await.unwrap();
        assert_eq!(summary.loaded, 2);

        let result = reopened.rollback_engine().rollback("r1-contacts").await.unwrap();
        assert_eq!(result.reverted.len(), 2);
        assert!(reopened.target().records("contacts").await.is_empty());
    }
}
