//! Object lifecycle benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use depot::broker::{Broker, BrokerConfig, ChannelId};
use depot::protocol::{Request, SharePolicy, PROTOCOL_VERSION};
use depot::token::Token;

fn greeted_broker(arena: usize) -> (Broker, ChannelId) {
    let config = BrokerConfig {
        token_seed: 7,
        ..Default::default()
    };
    let mut broker = Broker::with_heap(arena, config).unwrap();
    let ch = broker.open_channel();
    broker.dispatch(ch, 0, Request::Hello { version: PROTOCOL_VERSION });
    (broker, ch)
}

fn alloc(broker: &mut Broker, ch: ChannelId, seq: u64, size: u64) -> Token {
    broker
        .dispatch(ch, seq, Request::Alloc { size, clear: false, policy: SharePolicy::Standard })
        .into_reply()
        .unwrap()
        .token
        .unwrap()
}

fn bench_alloc_close(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_close");

    for size in [64u64, 1024, 16 * 1024] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (mut broker, ch) = greeted_broker(64 << 20);
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                let token = alloc(&mut broker, ch, seq, size);
                seq += 1;
                broker.dispatch(ch, seq, Request::Close { token });
                std::hint::black_box(token);
            });
        });
    }

    group.finish();
}

fn bench_publish_recycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_recycle");

    let (mut broker, ch) = greeted_broker(1 << 20);
    let mut seq = 1u64;
    let mut token = alloc(&mut broker, ch, 1, 4096);

    // One publish/unpublish round trip per iteration; the token changes
    // every time the object is reclaimed.
    group.throughput(Throughput::Elements(1));
    group.bench_function("4096", |b| {
        b.iter(|| {
            seq += 1;
            broker.dispatch(ch, seq, Request::Publish { token });
            seq += 1;
            let reply = broker
                .dispatch(ch, seq, Request::Unpublish { token, clear: false, wait: false })
                .into_reply()
                .unwrap();
            token = reply.token.unwrap();
        });
    });

    group.finish();
}

fn bench_open_close_published(c: &mut Criterion) {
    let mut group = c.benchmark_group("open_close_published");

    let (mut broker, writer) = greeted_broker(1 << 20);
    let reader = broker.open_channel();
    broker.dispatch(reader, 0, Request::Hello { version: PROTOCOL_VERSION });

    // The writer keeps its open so the object stays pinned.
    let token = alloc(&mut broker, writer, 1, 4096);
    broker.dispatch(writer, 2, Request::Publish { token });
    let mut seq = 2u64;

    group.throughput(Throughput::Elements(1));
    group.bench_function("second_channel", |b| {
        b.iter(|| {
            seq += 1;
            let reply = broker
                .dispatch(
                    reader,
                    seq,
                    Request::Open { token, policy: SharePolicy::Standard, wait: false },
                )
                .into_reply()
                .unwrap();
            seq += 1;
            broker.dispatch(reader, seq, Request::Close { token });
            std::hint::black_box(reply.offset);
        });
    });

    group.finish();
}

fn bench_voucher_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("voucher_roundtrip");

    let (mut broker, ch) = greeted_broker(1 << 20);
    let token = alloc(&mut broker, ch, 1, 4096);
    broker.dispatch(ch, 2, Request::Publish { token });
    let mut seq = 2u64;

    group.throughput(Throughput::Elements(1));
    group.bench_function("create_discard", |b| {
        b.iter(|| {
            seq += 1;
            let voucher = broker
                .dispatch(ch, seq, Request::CreateVoucher { token })
                .into_reply()
                .unwrap()
                .token
                .unwrap();
            seq += 1;
            broker.dispatch(ch, seq, Request::DiscardVoucher { token: voucher });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_close,
    bench_publish_recycle,
    bench_open_close_published,
    bench_voucher_roundtrip
);
criterion_main!(benches);
