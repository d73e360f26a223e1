//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use refinery_core::config::ApplyConfig;
use refinery_core::data::InMemoryDatasetAccess;
use refinery_core::engine::{ApplyEngine, run_local};
use refinery_core::export::{ExportTarget, export, import_script};
use refinery_core::pipeline::{PipelineEdit, PipelineHistory};
use refinery_core::{
    DataBatch, DatasetAccess, ExecMode, Params, Pipeline, TransformationRegistry,
    TransformationStep,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn cell() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        (-50i64..50).prop_map(Value::from),
    ]
}

fn param_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        ".{0,12}".prop_map(Value::from),
        prop::collection::vec(".{0,8}", 0..4).prop_map(|v| json!(v)),
    ]
}

fn step() -> impl Strategy<Value = TransformationStep> {
    (
        "[a-z_]{1,16}",
        prop::collection::btree_map("[a-z_]{1,10}", param_value(), 0..4),
    )
        .prop_map(|(type_id, params)| {
            let mut step = TransformationStep::new(type_id, Value::Null);
            step.params = params.into_iter().collect::<Params>();
            step
        })
}

// --- Export properties ---

proptest! {
    #[test]
    fn script_roundtrip_preserves_steps(steps in prop::collection::vec(step(), 0..6)) {
        let pipeline = Pipeline::from_steps("v1", steps);
        let script = export(&pipeline, ExportTarget::Script);
        let imported = import_script(&script, "v1").unwrap();
        prop_assert_eq!(imported.len(), pipeline.len());
        for (a, b) in imported.steps.iter().zip(&pipeline.steps) {
            prop_assert_eq!(&a.type_id, &b.type_id);
            prop_assert_eq!(&a.params, &b.params);
        }
        prop_assert_eq!(export(&imported, ExportTarget::Script), script);
    }

    #[test]
    fn export_is_deterministic(steps in prop::collection::vec(step(), 0..6)) {
        let a = Pipeline::from_steps("v1", steps.clone());
        let b = Pipeline::from_steps("v2", steps);
        prop_assert_eq!(export(&a, ExportTarget::Pandas), export(&b, ExportTarget::Pandas));
        prop_assert_eq!(a.content_hash(), b.content_hash());
    }
}

// --- Edit history properties ---

proptest! {
    #[test]
    fn undo_all_restores_initial(moves in prop::collection::vec((0usize..4, 0usize..4), 1..10)) {
        let initial = Pipeline::new("v1")
            .with_step("trim_whitespace", json!({}))
            .with_step("fix_casing", json!({}))
            .with_step("drop_missing", json!({}))
            .with_step("label_encode", json!({"columns": ["c"]}));
        let mut history = PipelineHistory::new(initial.clone(), 100);
        for (from, to) in &moves {
            let step_id = history.current().steps[*from].id.clone();
            history
                .edit(&PipelineEdit::Move { step_id, index: *to })
                .unwrap();
            prop_assert!(history.current().is_well_ordered());
        }
        while history.can_undo() {
            history.undo();
        }
        prop_assert_eq!(history.current(), &initial);
    }
}

// --- Execution properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn apply_matches_local_run_for_any_chunk_size(
        values in prop::collection::vec(cell(), 1..40),
        chunk_size in 1usize..12,
    ) {
        let records: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, v)| json!({"row": i % 5, "v": v}))
            .collect();
        let batch = DataBatch::from_records(&records).unwrap();

        runtime().block_on(async {
            let access = Arc::new(InMemoryDatasetAccess::new());
            let root = access.import("data", batch.clone()).await.unwrap();
            let (_, schema) = access.get_sample(&root, 0).await.unwrap();
            let pipeline = Pipeline::new(&root)
                .with_step("fill_backward", json!({"columns": ["v"]}))
                .with_step("fill_forward", json!({"columns": ["v"]}))
                .with_step("remove_duplicates", json!({"keep": "last"}))
                .with_step("fill_median", json!({"columns": ["v"]}));

            let registry = Arc::new(TransformationRegistry::with_builtins());
            let local = run_local(&registry, &pipeline, batch, &schema, ExecMode::Strict)
                .await
                .unwrap();

            let engine = ApplyEngine::new(registry, access.clone(), ApplyConfig { chunk_size });
            let outcome = engine.apply(&pipeline, "prop").await.unwrap();
            let (applied, _) = access
                .get_sample(&outcome.new_version_id, usize::MAX)
                .await
                .unwrap();
            assert_eq!(applied, local.output);
        });
    }

    #[test]
    fn bins_stay_in_range(
        scores in prop::collection::vec(-1000i64..1000, 1..50),
        bins in 2i64..10,
    ) {
        let records: Vec<Value> = scores.iter().map(|s| json!({"score": s})).collect();
        let batch = DataBatch::from_records(&records).unwrap();
        let schema = refinery_core::data::schema::infer_schema(&batch.columns, &batch.rows);
        let pipeline = Pipeline::new("v1")
            .with_step("create_bins", json!({"column": "score", "bins": bins}));
        let registry = TransformationRegistry::with_builtins();

        let run = runtime()
            .block_on(run_local(&registry, &pipeline, batch, &schema, ExecMode::Strict))
            .unwrap();
        let idx = run.output.column_index("score_bin").unwrap();
        let min = *scores.iter().min().unwrap();
        let max = *scores.iter().max().unwrap();
        for (row, score) in run.output.rows.iter().zip(&scores) {
            let label = row[idx].as_i64().unwrap();
            prop_assert!((0..bins).contains(&label));
            if *score == min {
                prop_assert_eq!(label, 0);
            }
            if *score == max && max > min {
                prop_assert_eq!(label, bins - 1);
            }
        }
    }
}
