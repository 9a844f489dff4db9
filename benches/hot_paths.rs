use std::time::Duration;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cpuwatch::alert::Debouncer;
use cpuwatch::config::{AlertConfig, DebouncePolicy};
use cpuwatch::sampler::Sample;
use cpuwatch::store::{Point, RecordStream};

fn samples(n: i64) -> Vec<Sample> {
    (0..n)
        .map(|i| {
            let ts = Utc
                .timestamp_opt(1_714_557_600 + i * 10, 0)
                .single()
                .expect("valid ts");
            // Alternate sustained high runs with dips.
            let percent = if (i / 7) % 2 == 0 { 92.0 } else { 40.0 };
            Sample::new(ts, percent).expect("valid sample")
        })
        .collect()
}

fn annotated_body(rows: usize) -> String {
    let mut body = String::from(
        "#datatype,string,long,dateTime:RFC3339,double\n,result,table,_time,_value\n",
    );
    for i in 0..rows {
        body.push_str(&format!(
            ",mean,0,2024-05-01T10:{:02}:{:02}Z,{}.5\n",
            i / 60 % 60,
            i % 60,
            i % 100
        ));
    }
    body
}

fn bench_debounce(c: &mut Criterion) {
    let samples = samples(1_000);
    let cfg = AlertConfig {
        threshold: 80.0,
        policy: DebouncePolicy::Sustained,
        sustain: Duration::from_secs(30),
        ..Default::default()
    };

    c.bench_function("debounce/evaluate_1000_samples", |b| {
        b.iter(|| {
            let mut d = Debouncer::new(&cfg, "localhost", Some("ops@example.com"));
            let mut fired = 0usize;
            for s in &samples {
                if d.evaluate(black_box(s)).is_fire() {
                    fired += 1;
                }
            }
            black_box(fired)
        });
    });
}

fn bench_line_protocol(c: &mut Criterion) {
    let ts = Utc
        .timestamp_opt(1_714_557_600, 123)
        .single()
        .expect("valid ts");
    let point = Point::new("cpu_usage", ts)
        .tag("host", "web-1.eu west")
        .field("percent", 42.123_456);

    c.bench_function("line_protocol/encode_cpu_sample", |b| {
        b.iter(|| black_box(&point).to_line_protocol().expect("encode"));
    });
}

fn bench_annotated_csv(c: &mut Criterion) {
    let body = annotated_body(20);

    c.bench_function("annotated_csv/parse_20_records", |b| {
        b.iter(|| RecordStream::new(black_box(body.as_bytes())).count());
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_debounce(c);
    bench_line_protocol(c);
    bench_annotated_csv(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
