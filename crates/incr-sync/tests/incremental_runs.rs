use std::sync::Arc;

use incr_core::{Identifier, IdentifierSet, JobSpec, RunMode};
use incr_storage::{CollectionStore, DirectoryCollectionStore, InMemoryCollectionStore, StoreCall};
use incr_sync::{open_run_from_env, DropReason, IncrementalConfig, IncrementalRun, ItemOutcome};
use serde_json::{json, Value as JsonValue};

fn items(ids: &[&str]) -> Vec<JsonValue> {
    ids.iter()
        .map(|id| json!({ "url": id, "price": 10 }))
        .collect()
}

fn config_with_batch(batch_size: usize) -> IncrementalConfig {
    IncrementalConfig {
        batch_size,
        ..IncrementalConfig::default()
    }
}

fn emit_all(run: &mut IncrementalRun, input: Vec<JsonValue>) -> Vec<String> {
    let mut emitted = Vec::new();
    for item in input {
        if let Some(item) = run.process_item(item).expect("process").into_item() {
            emitted.push(item["url"].as_str().unwrap_or_default().to_string());
        }
    }
    emitted
}

fn ids(values: &[&str]) -> IdentifierSet {
    values.iter().copied().map(Identifier::from).collect()
}

#[tokio::test]
async fn first_run_dedups_within_run_and_flushes_in_batches() {
    let store = Arc::new(InMemoryCollectionStore::new());
    let mut run = IncrementalRun::open(&JobSpec::new("spiderA"), &config_with_batch(2), store.clone())
        .await
        .expect("open");

    let emitted = emit_all(&mut run, items(&["a", "b", "a", "c"]));
    assert_eq!(emitted, vec!["a", "b", "c"]);
    assert_eq!(run.dedup_state().newly_seen(), &ids(&["a", "b", "c"]));

    let summary = run.close().await.expect("close");
    assert!(summary.first_run);
    assert_eq!(summary.counters.dropped_this_run, 1);
    assert_eq!(summary.flushed.batches, 2);

    let mut sizes = store.write_sizes().await;
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 2]);

    let persisted: IdentifierSet = store
        .entries("spiderA_seen_before")
        .await
        .into_iter()
        .filter_map(|e| e.item_id)
        .collect();
    assert_eq!(persisted, ids(&["a", "b", "c"]));
    assert_eq!(store.calls().await.last(), Some(&StoreCall::Close));
}

#[tokio::test]
async fn prior_run_identifiers_are_dropped() {
    let store = Arc::new(InMemoryCollectionStore::new().with_collection("spiderA_seen_before", ["a", "b"]));
    let mut run = IncrementalRun::open(&JobSpec::new("spiderA"), &IncrementalConfig::default(), store.clone())
        .await
        .expect("open");

    assert!(!run.admit("a").expect("admit"));
    assert!(run.admit("c").expect("admit"));

    let emitted = emit_all(&mut run, items(&["a", "c", "b", "d"]));
    assert_eq!(emitted, vec!["c", "d"]);
    assert_eq!(run.dedup_state().newly_seen(), &ids(&["c", "d"]));

    let summary = run.close().await.expect("close");
    assert_eq!(summary.prior_seen, 2);
    assert_eq!(summary.counters.dropped_previous_run, 2);
    assert_eq!(summary.counters.requests_rejected, 1);
    assert_eq!(summary.flushed.entries, 2);
    assert_eq!(store.entries("spiderA_seen_before").await.len(), 4);
}

#[tokio::test]
async fn second_run_over_identical_input_emits_nothing() {
    let store: Arc<InMemoryCollectionStore> = Arc::new(InMemoryCollectionStore::new());
    let input = items(&["a", "b", "c", "d", "e"]);

    let mut first = IncrementalRun::open(&JobSpec::new("spiderA"), &config_with_batch(3), store.clone())
        .await
        .expect("open first");
    assert_eq!(emit_all(&mut first, input.clone()).len(), 5);
    first.close().await.expect("close first");

    let mut second = IncrementalRun::open(&JobSpec::new("spiderA"), &config_with_batch(3), store.clone())
        .await
        .expect("open second");
    assert!(emit_all(&mut second, input).is_empty());
    let summary = second.close().await.expect("close second");
    assert!(!summary.first_run);
    assert_eq!(summary.flushed.batches, 0);
    assert_eq!(store.entries("spiderA_seen_before").await.len(), 5);
}

#[tokio::test]
async fn items_without_unique_field_pass_and_are_not_tracked() {
    let store = Arc::new(InMemoryCollectionStore::new());
    let mut run = IncrementalRun::open(&JobSpec::new("spiderA"), &IncrementalConfig::default(), store.clone())
        .await
        .expect("open");

    let record = json!({ "title": "orphan" });
    let first = run.process_item(record.clone()).expect("process");
    let second = run.process_item(record.clone()).expect("process");
    assert_eq!(first, ItemOutcome::PassedUntracked(record.clone()));
    assert_eq!(second, ItemOutcome::PassedUntracked(record));
    assert!(run.dedup_state().newly_seen().is_empty());

    let summary = run.close().await.expect("close");
    assert_eq!(summary.counters.passed_untracked, 2);
    assert!(store.write_sizes().await.is_empty());
}

#[tokio::test]
async fn full_crawl_never_touches_the_store_collection() {
    let store = Arc::new(InMemoryCollectionStore::new().with_collection("spiderA_seen_before", ["a"]));
    let job = JobSpec::new("spiderA").with_mode(RunMode::FullCrawl);
    let mut run = IncrementalRun::open(&job, &IncrementalConfig::default(), store.clone())
        .await
        .expect("open");

    assert!(run.admit("a").expect("admit"));
    let emitted = emit_all(&mut run, items(&["a", "a", "b"]));
    assert_eq!(emitted, vec!["a", "a", "b"]);

    let summary = run.close().await.expect("close");
    assert_eq!(summary.mode, RunMode::FullCrawl);
    assert_eq!(summary.flushed.batches, 0);
    assert_eq!(store.calls().await, vec![StoreCall::Close]);
}

#[tokio::test]
async fn full_crawl_flag_in_config_overrides_job_mode() {
    let store = Arc::new(InMemoryCollectionStore::new());
    let config = IncrementalConfig {
        full_crawl: true,
        ..IncrementalConfig::default()
    };
    let mut run = IncrementalRun::open(&JobSpec::new("spiderA"), &config, store.clone())
        .await
        .expect("open");
    assert!(run.mode().is_full_crawl());
    emit_all(&mut run, items(&["a"]));
    run.close().await.expect("close");
    assert!(store.write_sizes().await.is_empty());
}

#[tokio::test]
async fn custom_unique_field_is_used_for_dedup() {
    let store = Arc::new(InMemoryCollectionStore::new().with_collection("shop_seen_before", ["42"]));
    let config = IncrementalConfig {
        unique_field: "sku".to_string(),
        ..IncrementalConfig::default()
    };
    let mut run = IncrementalRun::open(&JobSpec::new("shop"), &config, store)
        .await
        .expect("open");

    let outcome = run
        .process_item(json!({ "sku": 42, "url": "https://shop.example/42" }))
        .expect("process");
    assert_eq!(
        outcome,
        ItemOutcome::Dropped {
            item_id: Identifier::from("42"),
            reason: DropReason::SeenInPreviousRun
        }
    );
    assert!(!run
        .process_item(json!({ "sku": 43 }))
        .expect("process")
        .is_dropped());
}

#[tokio::test]
async fn failed_flush_surfaces_and_keeps_written_batches() {
    let store = Arc::new(InMemoryCollectionStore::new().with_write_failure_after(1));
    let mut run = IncrementalRun::open(&JobSpec::new("spiderA"), &config_with_batch(1), store.clone())
        .await
        .expect("open");
    emit_all(&mut run, items(&["a", "b", "c"]));

    let err = run.close().await.unwrap_err();
    assert!(err.to_string().contains("spiderA_seen_before"));
    assert_eq!(store.entries("spiderA_seen_before").await.len(), 1);
}

#[tokio::test]
async fn directory_store_carries_state_between_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let open_store = || -> Arc<dyn CollectionStore> { Arc::new(DirectoryCollectionStore::new(dir.path())) };

    let mut first = IncrementalRun::open(&JobSpec::new("spiderA"), &config_with_batch(2), open_store())
        .await
        .expect("open first");
    assert_eq!(emit_all(&mut first, items(&["a", "b", "c"])).len(), 3);
    first.close().await.expect("close first");

    let mut second = IncrementalRun::open(&JobSpec::new("spiderA"), &config_with_batch(2), open_store())
        .await
        .expect("open second");
    assert_eq!(emit_all(&mut second, items(&["c", "d"])), vec!["d"]);
    let summary = second.close().await.expect("close second");
    assert_eq!(summary.prior_seen, 3);
    assert!(dir.path().join("spiderA_seen_before.jl").exists());
}

#[tokio::test]
async fn numeric_ids_written_by_other_tools_are_honoured() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("shop_seen_before.jl"),
        "{\"_key\":\"k1\",\"item_id\":\"41\"}\n{\"_key\":\"k2\",\"item_id\":42}\n{\"_key\":\"k3\",\"item_id\":{\"nested\":1}}\n",
    )
    .expect("seed collection");
    let config = IncrementalConfig {
        unique_field: "sku".to_string(),
        ..IncrementalConfig::default()
    };
    let mut run = IncrementalRun::open(&JobSpec::new("shop"), &config, Arc::new(DirectoryCollectionStore::new(dir.path())))
        .await
        .expect("open");

    assert_eq!(run.dedup_state().prior_seen(), &ids(&["41", "42"]));
    assert!(run.process_item(json!({ "sku": 42 })).expect("process").is_dropped());
    assert!(!run.process_item(json!({ "sku": 43 })).expect("process").is_dropped());
    run.close().await.expect("close");
}

#[tokio::test]
async fn run_opened_from_environment_uses_local_store_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::env::set_var("INCREMENTAL_STORE_DIR", dir.path());
    std::env::set_var("INCREMENTAL_PIPELINE_BATCH_SIZE", "2");

    let mut run = open_run_from_env(&JobSpec::new("envjob")).await.expect("open");
    assert_eq!(emit_all(&mut run, items(&["a", "b", "c"])).len(), 3);
    let summary = run.close().await.expect("close");

    std::env::remove_var("INCREMENTAL_STORE_DIR");
    std::env::remove_var("INCREMENTAL_PIPELINE_BATCH_SIZE");
    assert_eq!(summary.flushed.batches, 2);
    assert!(dir.path().join("envjob_seen_before.jl").exists());
}
