use criterion::{black_box, criterion_group, criterion_main, Criterion};

use proxyprobe::probe::classify::classify_message;
use proxyprobe::probe::request::parse_head;
use proxyprobe::proxy::protocol_order;
use proxyprobe::ParsedProxy;

fn bench_parse_proxy(c: &mut Criterion) {
    let inputs = [
        "10.0.0.1:8080",
        "proxy.example.com:3128:user:pass",
        "user:pass:proxy.example.com:1080",
        "socks5://user:p@ss:word@10.0.0.2:1080",
    ];

    c.bench_function("parse_proxy_mixed_formats", |b| {
        b.iter(|| {
            for input in inputs {
                black_box(ParsedProxy::parse(black_box(input)));
            }
        });
    });

    c.bench_function("parse_proxy_invalid", |b| {
        b.iter(|| {
            black_box(ParsedProxy::parse(black_box("not a proxy at all")));
        });
    });
}

fn bench_protocol_order(c: &mut Criterion) {
    c.bench_function("protocol_order_ports", |b| {
        b.iter(|| {
            for port in [80u16, 443, 1080, 3128, 4145, 8080, 9050, 54321] {
                black_box(protocol_order(black_box(port), false));
            }
        });
    });
}

fn bench_response_head(c: &mut Criterion) {
    let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 1256\r\nServer: nginx\r\nConnection: keep-alive\r\n\r\n";

    c.bench_function("parse_response_head", |b| {
        b.iter(|| {
            black_box(parse_head(black_box(raw)).ok());
        });
    });

    c.bench_function("classify_error_message", |b| {
        b.iter(|| {
            black_box(classify_message(black_box("read ECONNRESET from upstream")));
        });
    });
}

criterion_group!(benches, bench_parse_proxy, bench_protocol_order, bench_response_head);
criterion_main!(benches);
