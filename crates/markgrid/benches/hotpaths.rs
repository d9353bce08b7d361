use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::GrayImage;
use markgrid::synth::{render_sheet, RenderParams, SheetMarks};
use markgrid::{
    align, decide_sheet, sample_bubbles, AnswerKey, CapturedImage, GradeConfig, Grader, Template,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const OPTIONS: [&str; 5] = ["A", "B", "C", "D", "E"];

/// Two columns of 20 five-option questions on a letter-sized page.
fn exam40() -> Template {
    let json = r#"{
        "schema": "markgrid.template.v1",
        "name": "exam40",
        "page_size": [850, 1100],
        "bubble_size": [24, 24],
        "fiducials": [
            {"name": "tl", "center": [50, 50], "size": 44},
            {"name": "tr", "center": [800, 50], "size": 44},
            {"name": "bl", "center": [50, 1050], "size": 44},
            {"name": "br", "center": [800, 1050], "size": 44}
        ],
        "field_blocks": [
            {
                "name": "left",
                "origin": [120, 150],
                "field_labels": ["q1..20"],
                "bubble_values": ["A", "B", "C", "D", "E"],
                "bubbles_gap": 45,
                "labels_gap": 42
            },
            {
                "name": "right",
                "origin": [480, 150],
                "field_labels": ["q21..40"],
                "bubble_values": ["A", "B", "C", "D", "E"],
                "bubbles_gap": 45,
                "labels_gap": 42
            }
        ]
    }"#;
    match Template::from_json_str(json) {
        Ok(t) => t,
        Err(e) => panic!("bench template: {e}"),
    }
}

fn random_answers(seed: u64) -> Vec<(String, &'static str)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=40)
        .map(|q| (format!("q{q}"), OPTIONS[rng.gen_range(0..OPTIONS.len())]))
        .collect()
}

fn make_sheet_fixture(template: &Template, seed: u64) -> GrayImage {
    let answers = random_answers(seed);
    let marks = answers
        .iter()
        .fold(SheetMarks::new(), |m, (q, o)| m.mark(q, o));
    let params = RenderParams::fitted(template, (1275, 1650))
        .rotated(2.5)
        .tilted(4e-5, -3e-5)
        .with_shading(0.2)
        .with_noise(8, seed);
    render_sheet(template, &marks, &params)
}

fn bench_align(c: &mut Criterion) {
    let template = exam40();
    let config = GradeConfig::default();
    let img = make_sheet_fixture(&template, 11);

    c.bench_function("align_1275x1650", |b| {
        b.iter(|| {
            let aligned = align(black_box(&img), black_box(&template), black_box(&config));
            black_box(aligned.map(|a| a.confidence).unwrap_or(0.0))
        })
    });
}

fn bench_sample_and_decide(c: &mut Criterion) {
    let template = exam40();
    let config = GradeConfig::default();
    let img = make_sheet_fixture(&template, 13);
    let transform = match align(&img, &template, &config) {
        Ok(a) => a.transform_matrix(),
        Err(e) => panic!("fixture must align: {e}"),
    };

    c.bench_function("sample_bubbles_200", |b| {
        b.iter(|| {
            let signals = sample_bubbles(
                black_box(&img),
                black_box(&template),
                black_box(&transform),
                black_box(&config.sampler),
            );
            black_box(signals.len())
        })
    });

    let signals = sample_bubbles(&img, &template, &transform, &config.sampler);
    c.bench_function("decide_sheet_40q", |b| {
        b.iter(|| {
            let decisions = decide_sheet(black_box(&template), black_box(&signals), &config);
            black_box(decisions.len())
        })
    });
}

fn bench_batch(c: &mut Criterion) {
    let template = exam40();
    let key = random_answers(5)
        .iter()
        .try_fold(AnswerKey::new(), |k, (q, o)| k.with(q, o));
    let grader = match Grader::new(template.clone(), GradeConfig::default())
        .and_then(|g| g.with_answer_key(key?))
    {
        Ok(g) => g,
        Err(e) => panic!("bench grader: {e}"),
    };
    let images: Vec<CapturedImage> = (0..8)
        .map(|i| CapturedImage::new(format!("s{i}"), make_sheet_fixture(&template, 100 + i)))
        .collect();

    let mut group = c.benchmark_group("batch");
    group.sample_size(10);
    group.bench_function("grade_batch_8_sheets", |b| {
        b.iter(|| {
            let batch = grader.grade_batch(black_box(&images));
            black_box(batch.map(|r| r.stats.n_graded).unwrap_or(0))
        })
    });
    group.finish();
}

criterion_group!(hotpaths, bench_align, bench_sample_and_decide, bench_batch);
criterion_main!(hotpaths);
