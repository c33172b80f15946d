use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, criterion_group, criterion_main};
use http::StatusCode;
use micro_nio::buffer::Buffer;
use micro_nio::codec::{BodyPlan, RequestDecoder, ResponseEncoder};
use micro_nio::protocol::{ContentCoding, Message, PayloadItem, PayloadSize, RangeSet, ResponseHead};
use tokio_util::codec::{Decoder, Encoder};

const PIPELINED: &[u8] = b"GET /a HTTP/1.1\r\nHost: localhost\r\nUser-Agent: bench\r\n\r\n\
POST /b HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\r\nhello world\
GET /c HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip, deflate\r\n\r\n";

fn bench_request_decoder(c: &mut Criterion) {
    c.bench_function("decode_pipelined_requests", |b| {
        b.iter(|| {
            let mut decoder = RequestDecoder::new();
            let mut bytes = BytesMut::from(PIPELINED);
            while let Ok(Some(item)) = decoder.decode(&mut bytes) {
                black_box(item);
            }
        });
    });
}

fn head() -> ResponseHead {
    let mut head = ResponseHead::new(());
    *head.status_mut() = StatusCode::OK;
    head
}

fn bench_response_encoder(c: &mut Criterion) {
    let body = Bytes::from(vec![b'x'; 16 * 1024]);

    c.bench_function("encode_chunked_response", |b| {
        b.iter(|| {
            let mut encoder = ResponseEncoder::new();
            let mut dst = BytesMut::with_capacity(20 * 1024);
            encoder.encode(Message::Header((head(), BodyPlan::new(PayloadSize::Chunked))), &mut dst).unwrap();
            encoder.encode(Message::Payload(PayloadItem::Chunk(body.clone())), &mut dst).unwrap();
            encoder.encode(Message::Payload(PayloadItem::Eof), &mut dst).unwrap();
            black_box(dst);
        });
    });

    c.bench_function("encode_gzip_response", |b| {
        b.iter(|| {
            let mut encoder = ResponseEncoder::new();
            let mut dst = BytesMut::new();
            let mut plan = BodyPlan::new(PayloadSize::Chunked);
            plan.coding = Some(ContentCoding::Gzip);
            encoder.encode(Message::Header((head(), plan)), &mut dst).unwrap();
            encoder.encode(Message::Payload(PayloadItem::Chunk(body.clone())), &mut dst).unwrap();
            encoder.encode(Message::Payload(PayloadItem::Eof), &mut dst).unwrap();
            black_box(dst);
        });
    });
}

fn bench_buffer(c: &mut Criterion) {
    let block = [7u8; 1500];

    c.bench_function("buffer_write_drain", |b| {
        b.iter(|| {
            let buffer = Buffer::new();
            for _ in 0..64 {
                buffer.write(&block).unwrap();
            }
            buffer.flush().unwrap();
            while let Some(bytes) = buffer.readable() {
                buffer.release(bytes.len());
            }
        });
    });
}

fn bench_ranges(c: &mut Criterion) {
    c.bench_function("parse_resolve_ranges", |b| {
        b.iter(|| {
            let ranges = RangeSet::parse(black_box("bytes=0-99, 200-299, -50")).unwrap();
            black_box(ranges.resolve(10_000));
        });
    });
}

criterion_group!(benches, bench_request_decoder, bench_response_encoder, bench_buffer, bench_ranges);
criterion_main!(benches);
