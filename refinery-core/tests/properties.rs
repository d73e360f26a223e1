//! Integration tests for the guarantees that hold across components:
//! deterministic previews, immutable versions, all-or-nothing applies, a
//! well-formed lineage tree, immutable recipes, and export equivalence.

use pretty_assertions::assert_eq;
use refinery_core::config::{ApplyConfig, PreviewConfig};
use refinery_core::data::{BasicStats, FsDatasetAccess, InMemoryDatasetAccess};
use refinery_core::engine::{ApplyEngine, PreviewEngine, run_local};
use refinery_core::error::ErrorKind;
use refinery_core::export::{ExportTarget, export, import_script};
use refinery_core::lineage::LineageTracker;
use refinery_core::recipes::{NewRecipe, RecipeUpdate, SqliteRecipeStore};
use refinery_core::{
    ColumnSchema, ColumnType, DataBatch, DatasetAccess, ExecMode, Pipeline, SchemaDefinition,
    TransformationRegistry, TransformationStep,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn registry() -> Arc<TransformationRegistry> {
    Arc::new(TransformationRegistry::with_builtins())
}

fn people() -> DataBatch {
    const CITIES: [&str; 3] = ["Pune", "Oslo", "Lima"];
    let records: Vec<Value> = (0..40usize)
        .map(|i| {
            let age = if i % 5 == 0 {
                Value::Null
            } else {
                json!(20 + i % 13)
            };
            let city = CITIES[i % 3];
            json!({
                "id": i % 30,
                "name": format!("  Person {} ", i % 7),
                "city": city,
                "age": age,
                "joined": format!("2023-{:02}-{:02}", 1 + i % 12, 1 + i % 28),
                "score": (i * 7) % 100,
            })
        })
        .collect();
    DataBatch::from_records(&records).unwrap()
}

async fn all_rows(access: &dyn DatasetAccess, version: &str) -> DataBatch {
    access.get_sample(version, usize::MAX).await.unwrap().0
}

#[tokio::test]
async fn preview_is_deterministic() {
    let access = Arc::new(InMemoryDatasetAccess::new());
    let root = access.import("people", people()).await.unwrap();
    let engine = PreviewEngine::new(
        registry(),
        access.clone(),
        Arc::new(BasicStats),
        PreviewConfig::default(),
    );
    let pipeline = Pipeline::new(&root)
        .with_step("trim_whitespace", json!({}))
        .with_step("fill_median", json!({"columns": ["age"]}))
        .with_step("one_hot_encode", json!({"columns": ["city"]}));

    let first = engine.preview(&pipeline, Some(25)).await.unwrap();
    let second = engine.preview(&pipeline, Some(25)).await.unwrap();

    assert_eq!(
        serde_json::to_string(&*first).unwrap(),
        serde_json::to_string(&*second).unwrap()
    );
    assert_eq!(access.list_versions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn apply_leaves_parent_untouched() {
    let access = Arc::new(InMemoryDatasetAccess::new());
    let root = access.import("people", people()).await.unwrap();
    let before_version = access.get_version(&root).await.unwrap();
    let before_rows = all_rows(access.as_ref(), &root).await;

    let engine = ApplyEngine::new(registry(), access.clone(), ApplyConfig { chunk_size: 7 });
    let pipeline = Pipeline::new(&root)
        .with_step("drop_missing", json!({"columns": ["age"]}))
        .with_step("to_string", json!({"columns": ["score"]}))
        .with_step("label_encode", json!({"columns": ["city"]}));
    engine.apply(&pipeline, "ann").await.unwrap();

    assert_eq!(access.get_version(&root).await.unwrap(), before_version);
    assert_eq!(all_rows(access.as_ref(), &root).await, before_rows);
}

#[tokio::test]
async fn output_does_not_depend_on_chunk_size() {
    let access = Arc::new(InMemoryDatasetAccess::new());
    let root = access.import("people", people()).await.unwrap();
    let pipeline = Pipeline::new(&root)
        .with_step("trim_whitespace", json!({}))
        .with_step("remove_duplicates", json!({"subset": ["id"], "keep": "last"}))
        .with_step("fill_backward", json!({"columns": ["age"]}))
        .with_step("fill_mode", json!({"columns": ["age"]}))
        .with_step("create_bins", json!({"column": "score", "bins": 4}))
        .with_step("one_hot_encode", json!({"columns": ["city"]}));

    let mut outputs = Vec::new();
    for chunk_size in [1, 3, 16, 10_000] {
        let engine = ApplyEngine::new(registry(), access.clone(), ApplyConfig { chunk_size });
        let outcome = engine.apply(&pipeline, "ann").await.unwrap();
        outputs.push(all_rows(access.as_ref(), &outcome.new_version_id).await);
    }
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(outputs[0].row_count(), 30);
}

#[tokio::test]
async fn failing_chunk_leaves_no_version() {
    let dir = tempfile::tempdir().unwrap();
    let access = Arc::new(FsDatasetAccess::new(dir.path()));
    let mut records: Vec<Value> = (0..20).map(|i| json!({"v": i})).collect();
    records[17] = json!({"v": "seventeen"});
    let batch = DataBatch::from_records(&records).unwrap();
    let schema = SchemaDefinition::new(vec![ColumnSchema::new("v", ColumnType::Integer, false)]);
    let root = access.import_with_schema("mixed", batch, schema).await.unwrap();

    let engine = ApplyEngine::new(registry(), access.clone(), ApplyConfig { chunk_size: 4 });
    let pipeline = Pipeline::new(&root).with_step("create_bins", json!({"column": "v"}));
    let err = engine.apply(&pipeline, "ann").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(access.list_versions().await.unwrap().len(), 1);
    assert!(access.children(&root).await.unwrap().is_empty());
    let staging = dir.path().join("staging");
    let leftovers = std::fs::read_dir(&staging).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn lineage_forms_a_tree() {
    let access = Arc::new(InMemoryDatasetAccess::new());
    let root = access.import("people", people()).await.unwrap();
    let engine = ApplyEngine::new(registry(), access.clone(), ApplyConfig::default());

    let trim = Pipeline::new(&root).with_step("trim_whitespace", json!({}));
    let upper = Pipeline::new(&root).with_step("fix_casing", json!({"case": "upper"}));
    let (a, b) = tokio::join!(engine.apply(&trim, "ann"), engine.apply(&upper, "bob"));
    let a = a.unwrap().new_version_id;
    let b = b.unwrap().new_version_id;

    let dedupe = Pipeline::new(&a).with_step("remove_duplicates", json!({}));
    let c = engine.apply(&dedupe, "ann").await.unwrap().new_version_id;

    let tracker = LineageTracker::new(access.clone());
    let report = tracker.verify_tree().await.unwrap();
    assert!(report.is_valid(), "{:?}", report.problems);
    assert_eq!(report.versions, 4);
    assert_eq!(report.roots, vec![root.clone()]);

    let mut children: Vec<String> = tracker
        .children(&root)
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.id)
        .collect();
    children.sort();
    let mut expected = vec![a.clone(), b.clone()];
    expected.sort();
    assert_eq!(children, expected);
    assert!(tracker.children(&c).await.unwrap().is_empty());

    let path: Vec<String> = tracker
        .ancestry(&c)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.version.id)
        .collect();
    assert_eq!(path, vec![root.clone(), a.clone(), c.clone()]);
    assert_eq!(tracker.parent(&c).await.unwrap().map(|v| v.id), Some(a));
    assert!(tracker.parent(&root).await.unwrap().is_none());
}

#[tokio::test]
async fn used_recipe_steps_never_change() {
    let access = Arc::new(InMemoryDatasetAccess::new());
    let root = access.import("people", people()).await.unwrap();
    let engine = ApplyEngine::new(registry(), access.clone(), ApplyConfig::default());
    let store = SqliteRecipeStore::in_memory().unwrap();

    let steps = vec![TransformationStep::new("trim_whitespace", json!({}))];
    let id = store
        .create(NewRecipe::new("tidy", "ann", steps).public())
        .await
        .unwrap();
    store.apply(&engine, &id, &root, "bob").await.unwrap();
    let used = store.get(&id).await.unwrap();
    assert_eq!(used.usage_count, 1);

    let revised = vec![TransformationStep::new("remove_special_chars", json!({}))];
    let new_id = store.revise_steps(&id, "ann", revised).await.unwrap();
    assert_ne!(new_id, id);

    let update = RecipeUpdate {
        description: Some("trims text".into()),
        ..RecipeUpdate::default()
    };
    store.update_metadata(&id, "ann", update).await.unwrap();

    let after = store.get(&id).await.unwrap();
    assert_eq!(after.steps, used.steps);
    assert_eq!(after.description, "trims text");
    assert_eq!(store.get(&new_id).await.unwrap().derived_from, Some(id));
}

/// Export to a script, import it back, run it locally on the source rows,
/// and compare with what apply committed.
async fn assert_export_equivalent(pipeline_of: impl Fn(&str) -> Pipeline) {
    let access = Arc::new(InMemoryDatasetAccess::new());
    let root = access.import("people", people()).await.unwrap();
    let pipeline = pipeline_of(&root);
    let engine = ApplyEngine::new(registry(), access.clone(), ApplyConfig { chunk_size: 6 });
    let outcome = engine.apply(&pipeline, "ann").await.unwrap();
    let applied = all_rows(access.as_ref(), &outcome.new_version_id).await;

    let script = export(&pipeline, ExportTarget::Script);
    let imported = import_script(&script, &root).unwrap();
    assert_eq!(export(&imported, ExportTarget::Script), script);

    let (source, schema) = access.get_sample(&root, usize::MAX).await.unwrap();
    let local = run_local(&registry(), &imported, source, &schema, ExecMode::Strict)
        .await
        .unwrap();
    assert_eq!(local.output, applied);
    assert_eq!(local.schema.names(), outcome.diagnostics.columns_after);
}

#[tokio::test]
async fn export_roundtrip_cleaning() {
    assert_export_equivalent(|root| {
        Pipeline::new(root)
            .with_step("trim_whitespace", json!({}))
            .with_step("fix_casing", json!({"case": "title"}))
            .with_step("remove_duplicates", json!({"subset": ["name"]}))
    })
    .await;
}

#[tokio::test]
async fn export_roundtrip_missing_values() {
    assert_export_equivalent(|root| {
        Pipeline::new(root)
            .with_step("fill_forward", json!({"columns": ["age"]}))
            .with_step("fill_mean", json!({"columns": ["age"]}))
    })
    .await;
}

#[tokio::test]
async fn export_roundtrip_type_conversion() {
    assert_export_equivalent(|root| {
        Pipeline::new(root)
            .with_step("to_string", json!({"columns": ["id"]}))
            .with_step("to_datetime", json!({"columns": ["joined"]}))
    })
    .await;
}

#[tokio::test]
async fn export_roundtrip_feature_engineering() {
    assert_export_equivalent(|root| {
        Pipeline::new(root)
            .with_step("extract_date_parts", json!({"columns": ["joined"]}))
            .with_step("create_bins", json!({"column": "score", "bins": 3}))
            .with_step("one_hot_encode", json!({"columns": ["city"]}))
    })
    .await;
}
