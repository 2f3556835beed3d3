use anchorage::core::formatter::{self, FormatOptions};
use anchorage::core::knowledge::{KnowledgeKind, KnowledgeObject, SectionValue};
use anchorage::core::ledger::{ExecuteLedger, LogKind};
use anchorage::core::route::{RoutePlan, RouteStage};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

fn sample_document(sections: usize) -> String {
    let mut out = String::new();
    for i in 0..sections {
        out.push_str(&format!(
            "# SECTION {i}\r\nCaf\u{e9} notes \u{2014} \u{201c}item {i}\u{201d}   \n\n\n\n- first\n- second\n"
        ));
    }
    out
}

fn sample_ledger(stages: u32, entries: usize) -> ExecuteLedger {
    let plan = RoutePlan::new(
        KnowledgeObject::new(KnowledgeKind::Wko, 7),
        (1..=stages)
            .map(|n| RouteStage::new(&format!("S{n}"), n, &format!("Stage {n}")))
            .collect(),
    )
    .unwrap();
    let mut ledger = ExecuteLedger::seed_from_route(&plan, 1).unwrap();
    for n in 1..=stages {
        for e in 0..entries {
            ledger = ledger
                .append(&format!("S{n}"), n, LogKind::Decisions, &format!("decision {e}"))
                .unwrap();
        }
    }
    ledger
}

fn bench_format_document(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_document");
    group.measurement_time(Duration::from_secs(5));
    let opts = FormatOptions::default();

    for sections in [8usize, 64, 512] {
        let raw = sample_document(sections);
        group.bench_with_input(BenchmarkId::from_parameter(sections), &raw, |b, raw| {
            b.iter(|| black_box(formatter::format_document(raw, &opts).unwrap()));
        });
    }
    group.finish();
}

fn bench_render_knowledge(c: &mut Criterion) {
    let mut object = KnowledgeObject::new(KnowledgeKind::Cko, 7);
    object
        .sections
        .insert("canonical_summary".to_string(), SectionValue::text("Reduce onboarding time"));
    object.sections.insert(
        "assumptions".to_string(),
        SectionValue::bullets((0..50).map(|i| format!("assumption {i}"))),
    );
    let opts = FormatOptions::default();

    c.bench_function("render_knowledge_cko", |b| {
        b.iter(|| black_box(formatter::render_knowledge(&object, &opts).unwrap()));
    });
}

fn bench_ledger_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_block");
    let opts = FormatOptions::default();

    for (stages, entries) in [(3u32, 5usize), (12, 20)] {
        let ledger = sample_ledger(stages, entries);
        let block = formatter::render_ledger_block(&ledger, &opts).unwrap();
        let id = format!("{stages}x{entries}");

        group.bench_with_input(BenchmarkId::new("render", &id), &ledger, |b, ledger| {
            b.iter(|| black_box(formatter::render_ledger_block(ledger, &opts).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("parse", &id), &block, |b, block| {
            b.iter(|| black_box(formatter::parse_json_block::<ExecuteLedger>(block).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_format_document, bench_render_knowledge, bench_ledger_block);
criterion_main!(benches);
