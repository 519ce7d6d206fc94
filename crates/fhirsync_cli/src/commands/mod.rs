//! CLI command implementations.

pub mod conflicts;
pub mod invalidate;
pub mod resolve;
pub mod status;
pub mod sync;
pub mod watch;

use crate::fetcher::BundleDirFetcher;
use crate::store::JsonFileStore;
use fhirsync_engine::{
    AccessToken, AuthenticatedClient, Connection, StaticAuthenticator, SyncConfig, SyncEngine,
};
use fhirsync_model::R4Mapper;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    /// Directory holding `records.json` and `sync_state.json`.
    pub data_dir: PathBuf,
    /// Connection ID the sync state is kept under.
    pub connection: String,
}

/// An engine together with the file store behind it.
pub struct Session {
    /// The engine.
    pub engine: Arc<SyncEngine>,
    /// Local data and sync state store.
    pub store: Arc<JsonFileStore>,
}

impl Context {
    /// Builds an engine over the data directory.
    ///
    /// Without `bundles` the engine can report and settle state but every
    /// sync pass fails at the fetch step.
    pub fn open(
        &self,
        config: SyncConfig,
        bundles: Option<&Path>,
    ) -> Result<Session, Box<dyn std::error::Error>> {
        let store = Arc::new(JsonFileStore::open(&self.data_dir)?);
        let (source, fetcher) = match bundles {
            Some(dir) => (
                format!("file://{}", dir.display()),
                BundleDirFetcher::new(dir),
            ),
            None => ("file://".to_string(), BundleDirFetcher::detached()),
        };
        let client = AuthenticatedClient::new(
            Connection::new(&self.connection, source),
            AccessToken::new("local"),
        );

        let engine = Arc::new(SyncEngine::new(
            config,
            Arc::new(StaticAuthenticator::new(client)),
            Arc::new(fetcher),
            Arc::new(R4Mapper),
            store.clone(),
            store.clone(),
        ));
        Ok(Session { engine, store })
    }
}

/// Returns true if `format` asks for JSON output.
pub fn is_json(format: &str) -> bool {
    format.eq_ignore_ascii_case("json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_engine::SyncOptions;
    use fhirsync_model::{Collection, ConflictPolicy, ConflictResolution, ResourceType};
    use fhirsync_testkit::{bundle_json, condition_json, immunization_json, patient_json};
    use std::fs;
    use tempfile::tempdir;

    fn context(dir: &Path) -> Context {
        Context {
            data_dir: dir.join("data"),
            connection: "default".into(),
        }
    }

    fn write_bundle(dir: &Path, resources: Vec<serde_json::Value>) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("bundle.json"),
            serde_json::to_vec(&bundle_json(resources)).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn checkpoint_survives_between_sessions() {
        let root = tempdir().unwrap();
        let bundles = root.path().join("bundles");
        write_bundle(
            &bundles,
            vec![
                patient_json("pat-1"),
                condition_json("cond-1", "2024-01-01T00:00:00Z", "Asthma"),
                immunization_json("imm-1", "2024-01-01T00:00:00Z", "Influenza"),
            ],
        );
        let ctx = context(root.path());

        let session = ctx.open(SyncConfig::default(), Some(&bundles)).unwrap();
        let first = session.engine.sync(SyncOptions::default()).await;
        assert!(first.success);
        assert!(first.full_refresh);
        assert_eq!(session.store.count(Collection::Conditions), 1);
        drop(session);

        let session = ctx.open(SyncConfig::default(), Some(&bundles)).unwrap();
        let second = session.engine.sync(SyncOptions::default()).await;
        assert!(second.success);
        assert!(!second.full_refresh);
        assert_eq!(second.items_synced[&ResourceType::Condition], 0);
        assert!(second.new_data.is_empty());

        session.engine.invalidate_cache().await.unwrap();
        let third = session.engine.sync(SyncOptions::default()).await;
        assert!(third.full_refresh);
        assert!(third.new_data.is_empty());
        assert_eq!(session.store.count(Collection::Vaccinations), 1);
    }

    #[tokio::test]
    async fn manual_conflict_resolved_in_later_session() {
        let root = tempdir().unwrap();
        let bundles = root.path().join("bundles");
        write_bundle(
            &bundles,
            vec![condition_json("cond-1", "2024-01-01T00:00:00Z", "Asthma")],
        );
        let ctx = context(root.path());
        let config = SyncConfig::default().with_conflict_resolution(ConflictPolicy::Manual);

        let session = ctx.open(config.clone(), Some(&bundles)).unwrap();
        session.engine.sync(SyncOptions::default()).await;
        session
            .engine
            .record_local_edit(Collection::Conditions, "cond-1")
            .await
            .unwrap();
        let server_update = (chrono::Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        write_bundle(
            &bundles,
            vec![condition_json("cond-1", &server_update, "Severe asthma")],
        );
        let result = session.engine.sync(SyncOptions::default()).await;
        assert_eq!(result.conflicts.len(), 1);
        let id = result.conflicts[0].id;
        drop(session);

        let session = ctx.open(config, None).unwrap();
        session.engine.initialize().await.unwrap();
        assert_eq!(session.engine.get_pending_conflicts().len(), 1);
        session
            .engine
            .resolve_conflict(id, ConflictResolution::Server, None)
            .await
            .unwrap();

        let stored = fhirsync_engine::LocalDataStore::conditions(session.store.as_ref())
            .await
            .unwrap();
        assert_eq!(stored[0].name, "Severe asthma");
        assert!(session.engine.get_pending_conflicts().is_empty());
    }

    #[tokio::test]
    async fn sync_without_bundles_fails_cleanly() {
        let root = tempdir().unwrap();
        let session = context(root.path())
            .open(SyncConfig::default(), None)
            .unwrap();
        let result = session.engine.sync(SyncOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(!root.path().join("data").join("sync_state.json").exists());
    }

    #[test]
    fn json_format_flag() {
        assert!(is_json("json"));
        assert!(is_json("JSON"));
        assert!(!is_json("text"));
    }
}
