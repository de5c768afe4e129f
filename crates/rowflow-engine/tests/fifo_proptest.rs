use proptest::prelude::*;
use rowflow_engine::{
    EngineSettings, HopDecl, PipelineBuilder, PipelineGraph, RowCollector, StepDecl,
};
use rowflow_types::{FieldMeta, FieldType, Schema, Value};

fn run_chain(ids: &[i64], capacity: usize, hops: usize) -> Vec<i64> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let mut graph = PipelineGraph::new("fifo_prop").step(StepDecl::new("s0", "injector"));
        for i in 1..=hops {
            graph = graph
                .step(StepDecl::new(format!("s{i}"), "dummy"))
                .hop(HopDecl::new(format!("s{}", i - 1), format!("s{i}")).with_capacity(capacity));
        }
        let settings = EngineSettings {
            channel_capacity: capacity.max(1),
            poll_interval_ms: 2,
            ..EngineSettings::default()
        };
        let mut pipeline = PipelineBuilder::new(graph).settings(settings).build().unwrap();
        let injector = pipeline.add_injector("s0", 0).unwrap();
        let collector = RowCollector::new();
        pipeline
            .add_row_listener(&format!("s{hops}"), 0, collector.clone())
            .unwrap();
        pipeline.start().unwrap();

        let owned = ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let schema = Schema::new(vec![FieldMeta::new("id", FieldType::Integer)]).into_ref();
            for id in owned {
                injector.push(&schema, vec![Value::Integer(id)]).unwrap();
            }
            injector.finish();
        })
        .await
        .unwrap();

        let result = pipeline.wait_until_finished().await.unwrap();
        assert!(result.success);
        collector
            .rows_read()
            .iter()
            .map(|r| match r.get(0) {
                Some(Value::Integer(id)) => *id,
                _ => unreachable!(),
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn rows_keep_push_order_through_a_chain(
        ids in proptest::collection::vec(any::<i64>(), 0..200),
        capacity in 0_usize..6,
        hops in 1_usize..4,
    ) {
        prop_assert_eq!(run_chain(&ids, capacity, hops), ids);
    }
}
