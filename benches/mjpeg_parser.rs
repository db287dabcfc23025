use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use webcam_share::capture::Frame;
use webcam_share::codec::JpegEncoder;
use webcam_share::network::MjpegParser;
use webcam_share::protocol::part_header;

/// A multipart body carrying `count` copies of a 640x480 JPEG
fn multipart_body(count: usize) -> Vec<u8> {
    let mut encoder = JpegEncoder::new(80).expect("quality in range");
    let jpeg = encoder
        .encode(&Frame::solid(640, 480, [30, 120, 200]))
        .expect("encodable frame");

    let mut body = Vec::new();
    for _ in 0..count {
        body.extend_from_slice(part_header(jpeg.len()).as_bytes());
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n");
    }
    body
}

fn bench_parser(c: &mut Criterion) {
    let body = multipart_body(30);
    let mut group = c.benchmark_group("mjpeg_parser");
    group.throughput(Throughput::Bytes(body.len() as u64));

    for chunk in [1024usize, 16 * 1024, 64 * 1024] {
        group.bench_with_input(BenchmarkId::new("chunked", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut parser = MjpegParser::new(1024 * 1024);
                let mut frames = 0;
                for piece in body.chunks(chunk) {
                    parser.push(piece);
                    while let Some(jpeg) = parser.next_jpeg() {
                        black_box(jpeg);
                        frames += 1;
                    }
                }
                assert_eq!(frames, 30);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parser);
criterion_main!(benches);
