use criterion::{Criterion, black_box, criterion_group, criterion_main};
use prepline_core::augment::{AugmentationMethod, augment};
use prepline_core::normalize::{NativeValue, normalize};
use prepline_core::validate::validate;
use prepline_core::{
    AnalysisConfig, Analyzer, Column, ColumnTransformer, PreprocessingConfig, Table,
    ValidationRules,
};

fn sample_table(rows: usize) -> Table {
    let labels = ["alpha", "beta", "gamma"];
    Table::new(vec![
        Column::float(
            "x",
            (0..rows)
                .map(|i| (i % 17 != 0).then(|| (i as f64 * 0.37).sin() * 100.0))
                .collect(),
        ),
        Column::float("y", (0..rows).map(|i| Some((i as f64).sqrt())).collect()),
        Column::integer(
            "z",
            (0..rows).map(|i| (i % 11 != 0).then_some((i % 97) as i64)).collect(),
        ),
        Column::string(
            "label",
            (0..rows).map(|i| Some(labels[i % labels.len()])).collect(),
        ),
    ])
    .unwrap()
}

fn bench_transform(c: &mut Criterion) {
    let table = sample_table(10_000);
    let transformer = ColumnTransformer::new(PreprocessingConfig::default()).unwrap();

    c.bench_function("transform_10k_rows", |b| {
        b.iter(|| transformer.transform(black_box(&table)).unwrap())
    });
}

fn bench_validation(c: &mut Criterion) {
    let table = sample_table(10_000);
    let rules = ValidationRules::default();

    c.bench_function("validate_10k_rows", |b| {
        b.iter(|| validate(black_box(&table), &rules).unwrap())
    });
}

fn bench_analysis(c: &mut Criterion) {
    let table = sample_table(5_000);
    let analyzer = Analyzer::new(AnalysisConfig::default());

    c.bench_function("analyze_5k_rows", |b| {
        b.iter(|| analyzer.analyze(black_box(&table)).unwrap())
    });
}

fn bench_augmentation(c: &mut Criterion) {
    let table = sample_table(2_000);

    c.bench_function("mixup_2k_rows", |b| {
        b.iter(|| augment(black_box(&table), AugmentationMethod::Mixup, 1.0, None, Some(42)).unwrap())
    });

    c.bench_function("smote_2k_rows", |b| {
        b.iter(|| {
            augment(
                black_box(&table),
                AugmentationMethod::Smote,
                1.0,
                Some("label"),
                Some(42),
            )
            .unwrap()
        })
    });
}

fn bench_normalize(c: &mut Criterion) {
    let value = NativeValue::Map(
        (0..200)
            .map(|i| {
                (
                    format!("column_{i}"),
                    NativeValue::Seq(vec![
                        NativeValue::UInt(i),
                        NativeValue::WideUInt(u128::from(i) << 70),
                        NativeValue::FloatArray(vec![1.0, f64::NAN, 2.5]),
                    ]),
                )
            })
            .collect(),
    );

    c.bench_function("normalize_nested_report", |b| {
        b.iter(|| normalize(black_box(&value)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_transform,
    bench_validation,
    bench_analysis,
    bench_augmentation,
    bench_normalize,
);
criterion_main!(benches);
