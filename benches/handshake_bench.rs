//! Benchmarks for the upgrade handshake
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use http::StatusCode;

use sockudo_ws_server::handshake::{
    build_rejection, build_response, generate_accept_key, parse_protocols, validate,
};
use sockudo_ws_server::request::{Request, request_path};

const UPGRADE: &[u8] = b"GET /chat?room=42 HTTP/1.1\r\n\
    Host: server.example.com\r\n\
    Upgrade: websocket\r\n\
    Connection: keep-alive, Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Protocol: chat, superchat\r\n\
    Origin: http://example.com\r\n\
    \r\n";

/// Benchmark request head parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(UPGRADE.len() as u64));

    group.bench_function("upgrade_request", |b| {
        b.iter(|| Request::parse(black_box(UPGRADE)))
    });

    for target in ["/", "/chat?room=42", "http://host:8080/a/b/c?d=e#f"] {
        group.bench_with_input(BenchmarkId::new("request_path", target), target, |b, t| {
            b.iter(|| request_path(black_box(t)))
        });
    }

    group.finish();
}

/// Benchmark validation and response building
fn bench_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");
    let (request, _) = Request::parse(UPGRADE)
        .expect("valid request")
        .expect("complete request");

    group.bench_function("validate", |b| {
        b.iter(|| validate(black_box(&request), black_box(&[13, 8])))
    });

    group.bench_function("accept_key", |b| {
        b.iter(|| generate_accept_key(black_box("dGhlIHNhbXBsZSBub25jZQ==")))
    });

    group.bench_function("parse_protocols", |b| {
        b.iter(|| parse_protocols(black_box("chat, superchat, v2.chat")))
    });

    group.bench_function("build_response", |b| {
        b.iter(|| build_response(black_box("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="), Some("chat")))
    });

    group.bench_function("build_rejection", |b| {
        b.iter(|| build_rejection(black_box(StatusCode::UNAUTHORIZED), &[]))
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_handshake);
criterion_main!(benches);
