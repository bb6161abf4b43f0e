use unicontact_rs::test_support::{FailingRepository, RepoOp};
use unicontact_rs::{MemoryContactRepository, ReconcileError, ReconcileStage, Reconciler};

fn failing_reconciler() -> Reconciler<FailingRepository<MemoryContactRepository>> {
    Reconciler::new(FailingRepository::new(MemoryContactRepository::new()))
}

fn stage_of(err: ReconcileError) -> ReconcileStage {
    assert!(!err.is_client_error());
    assert!(!err.is_retryable());
    match err {
        ReconcileError::Repository { stage, .. } => stage,
        other => panic!("expected repository failure, got {other:?}"),
    }
}

#[tokio::test]
async fn lookup_failure_is_reported_at_matching() {
    let engine = failing_reconciler();
    engine.repository().fail_on(RepoOp::FindByEmailOrPhone);

    let err = engine.reconcile(Some("a@x.com"), None).await.unwrap_err();
    assert_eq!(stage_of(err), ReconcileStage::Matching);
    assert_eq!(engine.repository().calls(RepoOp::Insert), 0);
    assert!(engine.repository().inner().is_empty());
}

#[tokio::test]
async fn insert_failure_for_new_identity_is_reported_at_writing() {
    let engine = failing_reconciler();
    engine.repository().fail_on(RepoOp::Insert);

    let err = engine.reconcile(Some("a@x.com"), Some("111")).await.unwrap_err();
    assert_eq!(stage_of(err), ReconcileStage::Writing);
    assert!(engine.repository().inner().is_empty());
}

#[tokio::test]
async fn walk_failure_is_reported_at_resolving() -> anyhow::Result<()> {
    let engine = failing_reconciler();
    engine.reconcile(Some("a@x.com"), Some("111")).await?;
    engine.reconcile(Some("a@x.com"), Some("222")).await?;

    // Matching only the secondary forces a lookup of its primary.
    engine.repository().fail_on(RepoOp::FindById);
    let err = engine.reconcile(None, Some("222")).await.unwrap_err();
    assert_eq!(stage_of(err), ReconcileStage::Resolving);

    engine.repository().heal();
    engine.repository().fail_on(RepoOp::FindByLinkedId);
    let err = engine.reconcile(Some("a@x.com"), None).await.unwrap_err();
    assert_eq!(stage_of(err), ReconcileStage::Resolving);
    Ok(())
}

#[tokio::test]
async fn failed_merge_write_fails_the_whole_reconciliation() -> anyhow::Result<()> {
    let engine = failing_reconciler();
    engine.reconcile(Some("a@x.com"), Some("111")).await?;
    engine.reconcile(Some("b@y.com"), Some("222")).await?;

    engine.repository().fail_on(RepoOp::Update);
    let err = engine.reconcile(Some("a@x.com"), Some("222")).await.unwrap_err();
    assert_eq!(stage_of(err), ReconcileStage::Writing);
    assert!(engine.repository().calls(RepoOp::Update) >= 1);

    // Both clusters survive untouched and a retry after recovery completes the merge.
    let stored = engine.repository().inner().all_contacts();
    assert!(stored.iter().all(|contact| contact.is_primary()));

    engine.repository().heal();
    let resolution = engine.reconcile(Some("a@x.com"), Some("222")).await?;
    assert_eq!(resolution.demoted.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_insert_during_merge_reports_writing() -> anyhow::Result<()> {
    let engine = failing_reconciler();
    engine.reconcile(Some("a@x.com"), Some("111")).await?;

    engine.repository().fail_on(RepoOp::Insert);
    let err = engine.reconcile(Some("a@x.com"), Some("999")).await.unwrap_err();
    assert_eq!(stage_of(err), ReconcileStage::Writing);
    assert_eq!(engine.repository().inner().len(), 1);
    Ok(())
}

#[tokio::test]
async fn error_message_names_the_stage() {
    let engine = failing_reconciler();
    engine.repository().fail_on(RepoOp::FindByEmailOrPhone);

    let err = engine.reconcile(Some("a@x.com"), None).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("while matching"), "{message}");
    assert!(message.contains("injected failure"), "{message}");
}
