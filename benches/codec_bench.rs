//! Codec and auth benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_head_parsing(c: &mut Criterion) {
    use connect_relay::common::http::{parse_request, parse_response, serialize_request};

    let request = b"CONNECT www.example.com:443 HTTP/1.1\r\n\
        Host: www.example.com:443\r\n\
        User-Agent: curl/8.5.0\r\n\
        Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\
        Proxy-Connection: Keep-Alive\r\n\r\n";
    let response = b"HTTP/1.1 200 Connection Established\r\n\r\n";

    let mut many_headers = b"CONNECT a.example:443 HTTP/1.1\r\n".to_vec();
    for i in 0..200 {
        many_headers.extend_from_slice(format!("X-Filler-{}: value\r\n", i).as_bytes());
    }
    many_headers.extend_from_slice(b"\r\n");

    let mut group = c.benchmark_group("head_parsing");

    group.throughput(Throughput::Bytes(request.len() as u64));
    group.bench_function("parse_connect_request", |b| {
        b.iter(|| black_box(parse_request(black_box(request))))
    });

    group.throughput(Throughput::Bytes(many_headers.len() as u64));
    group.bench_function("parse_request_200_headers", |b| {
        b.iter(|| black_box(parse_request(black_box(&many_headers))))
    });

    group.throughput(Throughput::Bytes(response.len() as u64));
    group.bench_function("parse_connect_response", |b| {
        b.iter(|| black_box(parse_response(black_box(response))))
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("serialize_connect_request", |b| {
        let headers = [
            ("Host", "www.example.com:443"),
            ("Proxy-Authorization", "Basic YWxpY2U6c2VjcmV0"),
        ];
        b.iter(|| black_box(serialize_request("CONNECT", "www.example.com:443", &headers)))
    });

    group.finish();
}

fn bench_auth(c: &mut Criterion) {
    use connect_relay::common::auth::Credentials;

    let credentials: Credentials = (0..100)
        .map(|i| (format!("user{}", i), format!("password{}", i)))
        .collect();

    let mut group = c.benchmark_group("auth");
    group.throughput(Throughput::Elements(1));

    group.bench_function("verify_hit", |b| {
        // user7:password7
        b.iter(|| black_box(credentials.verify("Basic dXNlcjc6cGFzc3dvcmQ3")))
    });

    group.bench_function("verify_wrong_password", |b| {
        // user7:nope
        b.iter(|| black_box(credentials.verify("Basic dXNlcjc6bm9wZQ==")))
    });

    group.finish();
}

fn bench_endpoint_parse(c: &mut Criterion) {
    use connect_relay::common::net::Endpoint;

    let mut group = c.benchmark_group("endpoint");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_domain", |b| {
        b.iter(|| black_box(Endpoint::parse(black_box("www.example.com:443"))))
    });

    group.bench_function("parse_ipv6", |b| {
        b.iter(|| black_box(Endpoint::parse(black_box("[2001:db8::1]:8443"))))
    });

    group.finish();
}

criterion_group!(benches, bench_head_parsing, bench_auth, bench_endpoint_parse);
criterion_main!(benches);
