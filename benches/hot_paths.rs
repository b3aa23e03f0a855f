use std::time::SystemTime;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use snoopd::sink::line_protocol::encode_points;
use snoopd::sink::normalize::{normalize, NormalizeContext};
use snoopd::tracer::event::ProbeKind;
use snoopd::tracer::parse::{decode, EXEC_RECORD_SIZE, READLINE_RECORD_SIZE};

fn exec_payload() -> Vec<u8> {
    let mut data = vec![0u8; EXEC_RECORD_SIZE];
    data[0..8].copy_from_slice(&4_242u64.to_ne_bytes());
    data[8..16].copy_from_slice(&1u64.to_ne_bytes());
    data[16..20].copy_from_slice(b"bash");
    data[32..36].copy_from_slice(&0i32.to_ne_bytes());
    let argv = b"/usr/bin/git --no-pager log --oneline";
    data[36..36 + argv.len()].copy_from_slice(argv);
    data
}

fn readline_payload() -> Vec<u8> {
    let mut data = vec![0u8; READLINE_RECORD_SIZE];
    data[0..4].copy_from_slice(&4_242u32.to_ne_bytes());
    let line = b"kubectl get pods -n \"kube system\"";
    data[4..4 + line.len()].copy_from_slice(line);
    data
}

fn bench_decode(c: &mut Criterion) {
    let exec = exec_payload();
    let readline = readline_payload();

    c.bench_function("decode/exec_arg", |b| {
        b.iter(|| decode(ProbeKind::Execve, black_box(&exec)).expect("decode exec"))
    });

    c.bench_function("decode/readline", |b| {
        b.iter(|| decode(ProbeKind::Readline, black_box(&readline)).expect("decode readline"))
    });
}

fn bench_record_to_line(c: &mut Criterion) {
    let exec = exec_payload();
    let ctx = NormalizeContext::new("bench-node");
    let now = SystemTime::now();

    c.bench_function("pipeline/exec_record_to_line", |b| {
        b.iter(|| {
            let event = decode(ProbeKind::Execve, black_box(&exec)).expect("decode exec");
            let point = normalize(event, &ctx, now).expect("normalize");
            let line = encode_points(std::slice::from_ref(&point));
            black_box(line.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_record_to_line(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
