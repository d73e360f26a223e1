//! End-to-end scenarios: pipelines validated, previewed, and applied through
//! the `Refinery` facade over in-memory datasets.

use pretty_assertions::assert_eq;
use refinery_core::config::RefineryConfig;
use refinery_core::data::InMemoryDatasetAccess;
use refinery_core::error::ErrorKind;
use refinery_core::{DataBatch, DatasetAccess, Pipeline, Refinery};
use serde_json::{Value, json};
use std::sync::Arc;

async fn setup(records: Value) -> (Refinery, Arc<InMemoryDatasetAccess>, String) {
    let (refinery, access) = Refinery::in_memory(RefineryConfig::default()).unwrap();
    let batch = DataBatch::from_records(records.as_array().unwrap()).unwrap();
    let root = access.import("scenario", batch).await.unwrap();
    (refinery, access, root)
}

async fn records(access: &InMemoryDatasetAccess, version: &str) -> Vec<Value> {
    let (batch, _) = access.get_sample(version, usize::MAX).await.unwrap();
    batch.to_records()
}

#[tokio::test]
async fn remove_duplicates_keeps_first() {
    let (refinery, access, root) = setup(json!([
        {"id": 1, "name": "A"},
        {"id": 1, "name": "A"},
        {"id": 2, "name": "B"},
    ]))
    .await;
    let pipeline = Pipeline::new(&root).with_step("remove_duplicates", json!({"keep": "first"}));

    let outcome = refinery.apply(&pipeline, "ann").await.unwrap();

    assert_eq!(outcome.diagnostics.rows_after, 2);
    assert_eq!(outcome.diagnostics.steps[0].rows_affected, 1);
    assert_eq!(
        records(&access, &outcome.new_version_id).await,
        vec![json!({"id": 1, "name": "A"}), json!({"id": 2, "name": "B"})]
    );
}

#[tokio::test]
async fn fill_mean_imputes_average() {
    let (refinery, access, root) =
        setup(json!([{"age": 10}, {"age": null}, {"age": 20}])).await;
    let pipeline = Pipeline::new(&root).with_step("fill_mean", json!({"columns": ["age"]}));

    let outcome = refinery.apply(&pipeline, "ann").await.unwrap();

    let ages: Vec<Option<f64>> = records(&access, &outcome.new_version_id)
        .await
        .iter()
        .map(|r| r["age"].as_f64())
        .collect();
    assert_eq!(ages, vec![Some(10.0), Some(15.0), Some(20.0)]);
}

#[tokio::test]
async fn one_hot_encode_sorts_categories() {
    let (refinery, access, root) =
        setup(json!([{"color": "red"}, {"color": "blue"}, {"color": "red"}])).await;
    let pipeline =
        Pipeline::new(&root).with_step("one_hot_encode", json!({"columns": ["color"]}));

    let outcome = refinery.apply(&pipeline, "ann").await.unwrap();

    assert_eq!(
        outcome.diagnostics.columns_after,
        vec!["color_blue", "color_red"]
    );
    assert_eq!(
        records(&access, &outcome.new_version_id).await,
        vec![
            json!({"color_blue": 0, "color_red": 1}),
            json!({"color_blue": 1, "color_red": 0}),
            json!({"color_blue": 0, "color_red": 1}),
        ]
    );
}

#[tokio::test]
async fn fill_mean_on_text_fails_validation() {
    let (refinery, access, root) = setup(json!([{"name": "ann"}, {"name": "bob"}])).await;
    let pipeline = Pipeline::new(&root).with_step("fill_mean", json!({"columns": ["name"]}));

    let err = refinery.validate(&pipeline).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.violations().len(), 1);
    assert_eq!(err.violations()[0].target.as_deref(), Some("name"));

    let err = refinery.apply(&pipeline, "ann").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = refinery.preview(&pipeline, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(access.list_versions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn create_bins_splits_equal_width() {
    let (refinery, access, root) =
        setup(json!([{"score": 0}, {"score": 50}, {"score": 100}])).await;
    let pipeline =
        Pipeline::new(&root).with_step("create_bins", json!({"column": "score", "bins": 2}));

    let outcome = refinery.apply(&pipeline, "ann").await.unwrap();

    let bins: Vec<Value> = records(&access, &outcome.new_version_id)
        .await
        .iter()
        .map(|r| r["score_bin"].clone())
        .collect();
    assert_eq!(bins, vec![json!(0), json!(1), json!(1)]);
}

#[tokio::test]
async fn preview_reports_lenient_warnings() {
    let (refinery, _access, root) = setup(json!([
        {"when": "2024-03-09"},
        {"when": "not a date"},
        {"when": null},
    ]))
    .await;
    let pipeline =
        Pipeline::new(&root).with_step("extract_date_parts", json!({"columns": ["when"]}));

    let preview = refinery.preview(&pipeline, Some(10)).await.unwrap();

    assert_eq!(preview.sample_size, 3);
    assert_eq!(
        preview.columns_added,
        vec!["when_year", "when_month", "when_day", "when_dayofweek"]
    );
    assert_eq!(preview.steps[0].coercion_failures, 1);
    let first = &preview.after.to_records()[0];
    assert_eq!(first["when_year"], json!(2024));
    assert_eq!(first["when_dayofweek"], json!(5));
}
