//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipework::prelude::*;

fn identity_stage() -> FunctionStage {
    FunctionStage::new("identity", |_ctx, _env, io: &mut StageIo| {
        Box::pin(async move {
            if let (Some(reader), Some(writer)) = io.split() {
                tokio::io::copy(reader, writer).await?;
            }
            Ok(())
        })
    })
}

fn pipeline_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();

    c.bench_function("identity_function_stage_16k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ctx = Context::new();
                let mut pipeline = Pipeline::builder()
                    .stdin(std::io::Cursor::new(black_box(payload.clone())))
                    .build();
                pipeline.add(identity_stage());
                let out = pipeline.output(&ctx).await.expect("pipeline should run");
                black_box(out)
            })
        })
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
