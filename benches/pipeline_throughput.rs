use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use parley::pipeline::{
    ControlSignal, Frame, FrameKind, Stage, StageContext, StageError, TranscriptDelta, compose,
};
use std::hint::black_box;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const FRAMES: usize = 2_000;

struct Relay(String);

#[async_trait]
impl Stage for Relay {
    fn name(&self) -> &str {
        &self.0
    }

    async fn process(&mut self, frame: Frame, ctx: &mut StageContext) -> Result<(), StageError> {
        ctx.push(frame).await
    }
}

/// Pushes `FRAMES` transcripts and an `End` through `depth` relay stages.
async fn run_chain(depth: usize) -> usize {
    let stages: Vec<Box<dyn Stage>> = (0..depth)
        .map(|i| Box::new(Relay(format!("relay-{i}"))) as Box<dyn Stage>)
        .collect();
    let Ok(mut pipeline) = compose(stages) else {
        return 0;
    };
    let head = pipeline.head();
    let shared = pipeline.shared().clone();
    let Some(mut output) = pipeline.take_output() else {
        return 0;
    };
    let mut running = pipeline.start(CancellationToken::new());

    let feeder = tokio::spawn(async move {
        for i in 0..FRAMES {
            let kind = FrameKind::Transcript(TranscriptDelta::user(i.to_string(), false));
            if head.send(shared.stamp(kind)).await.is_err() {
                return;
            }
        }
        let end = shared.stamp(FrameKind::Control(ControlSignal::End));
        let _ = head.send(end).await;
    });

    let mut received = 0;
    while let Some(frame) = output.recv().await {
        received += usize::from(matches!(frame.kind(), FrameKind::Transcript(_)));
    }
    let _ = feeder.await;
    running.wait().await;
    received
}

fn pipeline_throughput(c: &mut Criterion) {
    let Ok(runtime) = Runtime::new() else {
        eprintln!("Skipping: could not start tokio runtime");
        return;
    };

    let mut group = c.benchmark_group("pipeline_throughput");
    group.throughput(Throughput::Elements(FRAMES as u64));
    for depth in [1, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let received = runtime.block_on(run_chain(black_box(depth)));
                assert_eq!(received, FRAMES);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, pipeline_throughput);
criterion_main!(benches);
