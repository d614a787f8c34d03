//! Throughput benchmarks for the frame queue.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use framewire::frame::Frame;
use framewire::queue::{ConnectionData, FrameQueue};
use std::hint::black_box;

fn cdata() -> ConnectionData {
    ConnectionData {
        writer_filter: 1,
        writer_id: 1,
        reader_filter: 2,
        reader_id: 1,
    }
}

fn bench_spsc_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_roundtrip");

    for &frame_size in &[1024usize, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(frame_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(frame_size),
            &frame_size,
            |b, &frame_size| {
                let frames = (0..8).map(|_| Frame::opaque(frame_size)).collect();
                let (mut writer, mut reader) =
                    FrameQueue::with_frames(cdata(), frames).unwrap().split();
                let mut seq = 0u64;

                b.iter(|| {
                    let frame = writer.rear().unwrap();
                    seq += 1;
                    frame.set_sequence(seq);
                    frame.set_length(frame_size);
                    writer.publish();

                    let front = reader.front().unwrap();
                    black_box(front.sequence());
                    reader.advance();
                });
            },
        );
    }
    group.finish();
}

fn bench_force_rear_overwrite(c: &mut Criterion) {
    c.bench_function("force_rear_full_queue", |b| {
        let frames = (0..4).map(|_| Frame::opaque(1024)).collect();
        let (mut writer, _reader) = FrameQueue::with_frames(cdata(), frames).unwrap().split();
        // Fill the ring so every claim has to retract.
        while let Some(frame) = writer.rear() {
            frame.set_length(1024);
            writer.publish();
        }

        let mut seq = 0u64;
        b.iter(|| {
            let frame = writer.force_rear();
            seq += 1;
            frame.set_sequence(seq);
            writer.publish();
        });
    });
}

criterion_group!(benches, bench_spsc_roundtrip, bench_force_rear_overwrite);
criterion_main!(benches);
