use collabwrite_core::{
    attributes, transform, ChangeLog, Committed, Delta, DocumentState, Operation,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn paragraph(words: usize) -> String {
    "lorem ipsum dolor sit amet ".repeat(words / 5 + 1)
}

fn bench_transform_typing(c: &mut Criterion) {
    let len = 2_000;
    let a = Operation::new("alice", 1, 0, Delta::new().retain(100).insert("x").retain(len - 100));
    let b = Operation::new(
        "bob",
        1,
        0,
        Delta::new().retain(900).delete(3).insert("yz").retain(len - 903),
    );

    c.bench_function("transform_single_char_2k_doc", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b)).unwrap()))
    });
}

fn bench_transform_formatting(c: &mut Criterion) {
    let mut a = Delta::new();
    let mut b = Delta::new();
    for i in 0..200 {
        a = a.retain_with(5, attributes([("bold", true)])).retain(5);
        b = if i % 2 == 0 {
            b.retain(7).delete(3)
        } else {
            b.retain_with(10, attributes([("color", "red")]))
        };
    }
    let a = Operation::new("alice", 1, 0, a);
    let b = Operation::new("bob", 1, 0, b);

    c.bench_function("transform_400_components", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b)).unwrap()))
    });
}

fn bench_compose_history(c: &mut Criterion) {
    let text = paragraph(500);
    let mut doc = DocumentState::from_text(&text);
    let mut log = ChangeLog::new(0);
    for i in 0..100u64 {
        let at = (i as usize * 17) % doc.len();
        let delta = Delta::new().retain(at).insert("ab").retain(doc.len() - at);
        let operation = Operation::new("writer", i, doc.revision(), delta);
        let revision = doc.apply(&operation.delta).unwrap();
        log.append(Committed { revision, operation }).unwrap();
    }

    c.bench_function("compose_100_commits", |bench| {
        bench.iter(|| black_box(log.compose_since(black_box(0)).unwrap()))
    });

    let tail = text.chars().count() - 10;
    let stale = Operation::new("late", 1, 0, Delta::new().retain(10).insert("!").retain(tail));
    c.bench_function("rebase_over_100_commits", |bench| {
        bench.iter(|| black_box(log.rebase(black_box(&stale)).unwrap()))
    });
}

fn bench_apply_large_document(c: &mut Criterion) {
    let text = paragraph(10_000);
    let len = text.chars().count();
    let edit = Delta::new().retain(len / 2).insert("hello").delete(10).retain(len - len / 2 - 10);

    c.bench_function("apply_edit_50k_doc", |bench| {
        bench.iter_batched(
            || DocumentState::from_text(&text),
            |mut doc| {
                doc.apply(&edit).unwrap();
                black_box(doc)
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_transform_typing,
    bench_transform_formatting,
    bench_compose_history,
    bench_apply_large_document,
);
criterion_main!(benches);
