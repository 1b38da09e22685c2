use object_reconciler::{
    errors::ReconcileError,
    models::{desired::ObjectConfig, identity::ObjectId},
    reconcile::{ReconcileSettings, Reconciler, plan::Plan},
    state::StateStore,
    transport::{
        StorageTransport, TransportError,
        sqlite::{SqliteTransport, run_migrations},
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{collections::BTreeMap, sync::Arc};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    transport: Arc<SqliteTransport>,
    reconciler: Reconciler,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();

    let transport = Arc::new(SqliteTransport::new(Arc::new(pool), dir.path().join("data")));
    let reconciler = Reconciler::new(
        transport.clone(),
        StateStore::new(dir.path().join("state")),
        ReconcileSettings::default(),
    );
    Harness {
        dir,
        transport,
        reconciler,
    }
}

#[tokio::test]
async fn file_source_lifecycle() {
    let h = harness().await;
    h.transport
        .create_bucket("tf-object-test", "local".into(), true, false)
        .await
        .unwrap();

    let source = h.dir.path().join("payload.txt");
    tokio::fs::write(&source, b"initial object state").await.unwrap();
    let config = ObjectConfig {
        bucket: "tf-object-test".into(),
        key: "test-key".into(),
        source: Some(source.clone()),
        content_type: Some("text/plain".into()),
        tags: BTreeMap::from([("Key1".to_string(), "AAA".to_string())]),
        ..Default::default()
    };

    let first = h.reconciler.apply("object", config.clone()).await.unwrap();
    assert!(first.is_complete());
    assert_eq!(
        first.state.observed.etag,
        format!("{:x}", md5::compute("initial object state"))
    );
    assert_eq!(
        h.reconciler.plan("object", config.clone()).await.unwrap().plan,
        Plan::NoOp
    );

    tokio::fs::write(&source, b"modified object").await.unwrap();
    let second = h.reconciler.apply("object", config.clone()).await.unwrap();
    assert_eq!(second.plan, Plan::ReplaceContent);
    assert_ne!(second.state.observed.version_id, first.state.observed.version_id);
    assert_eq!(second.state.observed.tags.get("Key1").map(String::as_str), Some("AAA"));

    let id = ObjectId::new("tf-object-test", "test-key");
    assert_eq!(h.transport.list_versions(&id).await.unwrap().len(), 2);

    let destroyed = h.reconciler.destroy("object").await.unwrap().unwrap();
    assert!(destroyed.delete_marker.is_some());
    assert!(h.transport.head(&id, None).await.unwrap().is_none());
    assert!(h.reconciler.read("object").await.unwrap().is_none());
}

#[tokio::test]
async fn metadata_change_on_unversioned_bucket() {
    let h = harness().await;
    h.transport
        .create_bucket("tf-object-test", "local".into(), false, false)
        .await
        .unwrap();

    let config = ObjectConfig {
        bucket: "tf-object-test".into(),
        key: "test-key".into(),
        content: Some("stuff".into()),
        ..Default::default()
    };
    h.reconciler.apply("object", config.clone()).await.unwrap();

    let outcome = h
        .reconciler
        .apply(
            "object",
            ObjectConfig {
                cache_control: Some("no-cache".into()),
                metadata: BTreeMap::from([("Key1".to_string(), "Value1".to_string())]),
                ..config.clone()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.plan, Plan::UpdateMetadataOnly);
    assert_eq!(outcome.state.observed.version_id, None);
    assert_eq!(
        outcome.state.observed.headers.cache_control.as_deref(),
        Some("no-cache")
    );
    assert_eq!(
        outcome.state.observed.metadata.get("key1").map(String::as_str),
        Some("Value1")
    );
    assert_eq!(outcome.state.observed.etag, format!("{:x}", md5::compute("stuff")));
}

#[tokio::test]
async fn lock_settings_need_a_lock_enabled_bucket() {
    let h = harness().await;
    h.transport
        .create_bucket("tf-object-test", "local".into(), true, false)
        .await
        .unwrap();

    let err = h
        .reconciler
        .apply(
            "object",
            ObjectConfig {
                bucket: "tf-object-test".into(),
                key: "test-key".into(),
                object_lock_legal_hold_status: Some("ON".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Transport(TransportError::Unsupported(_))
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn missing_bucket_is_reported() {
    let h = harness().await;

    let err = h
        .reconciler
        .apply(
            "object",
            ObjectConfig {
                bucket: "no-such-bucket".into(),
                key: "test-key".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Transport(TransportError::BucketNotFound(_))
    ));
}
