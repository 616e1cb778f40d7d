//! Benchmarks for schema comparison.
//!
//! Covers the two comparisons every generation runs: the catalog plan
//! between the replayed history and the model, and the line diff of their
//! `pg_dump` output that feeds the lock file.

use std::collections::BTreeMap;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use trek::migrate::DiffOptions;
use trek::migrate::dump::{DumpDiff, clean_dump};
use trek::migrate::introspect::{
    CatalogSnapshot, Column, Constraint, ConstraintKind, QualifiedName, Table,
};
use trek::migrate::sql::plan_changes;

/// Create a column.
fn column(name: &str, data_type: &str) -> Column {
    Column {
        name: name.to_string(),
        data_type: data_type.to_string(),
        not_null: false,
        default: None,
        identity: None,
        generated: None,
        collation: None,
    }
}

/// Create a snapshot with `tables` tables of `columns` columns each.
fn create_snapshot(tables: usize, columns: usize) -> CatalogSnapshot {
    let mut snapshot = CatalogSnapshot::default();
    snapshot.schemas.insert("public".to_string());
    for t in 0..tables {
        let mut cols = vec![Column {
            not_null: true,
            ..column("id", "bigint")
        }];
        cols.extend((0..columns).map(|c| column(&format!("field_{}", c), "text")));

        let mut constraints = BTreeMap::new();
        constraints.insert(
            format!("table_{}_pkey", t),
            Constraint {
                kind: ConstraintKind::PrimaryKey,
                definition: "PRIMARY KEY (id)".to_string(),
            },
        );

        snapshot.tables.insert(
            QualifiedName::new("public", format!("table_{}", t)),
            Table {
                columns: cols,
                constraints,
                ..Default::default()
            },
        );
    }
    snapshot
}

/// Render a snapshot roughly the way `pg_dump --schema-only` would.
fn create_dump(tables: usize, columns: usize, extra_column: bool) -> String {
    let mut dump = String::from(
        "--\n-- PostgreSQL database dump\n--\n\nSET statement_timeout = 0;\nSET lock_timeout = 0;\n\n",
    );
    for t in 0..tables {
        dump.push_str(&format!(
            "--\n-- Name: table_{0}; Type: TABLE; Schema: public\n--\n\nCREATE TABLE public.table_{0} (\n    id bigint NOT NULL",
            t
        ));
        for c in 0..columns {
            dump.push_str(&format!(",\n    field_{} text", c));
        }
        if extra_column && t % 10 == 0 {
            dump.push_str(",\n    email text");
        }
        dump.push_str("\n);\n\n");
    }
    dump
}

fn bench_plan_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_changes");
    let options = DiffOptions::default();

    for tables in [10, 100, 500] {
        let current = create_snapshot(tables, 8);
        let identical = current.clone();
        let mut changed = current.clone();
        for (_, table) in changed.tables.iter_mut().step_by(10) {
            table.columns.push(column("email", "text"));
        }

        group.throughput(Throughput::Elements(tables as u64));
        group.bench_with_input(BenchmarkId::new("identical", tables), &tables, |b, _| {
            b.iter(|| black_box(plan_changes(&current, &identical, &options)))
        });
        group.bench_with_input(BenchmarkId::new("add_columns", tables), &tables, |b, _| {
            b.iter(|| black_box(plan_changes(&current, &changed, &options)))
        });
        group.bench_with_input(BenchmarkId::new("initial", tables), &tables, |b, _| {
            b.iter(|| black_box(plan_changes(&CatalogSnapshot::default(), &current, &options)))
        });
    }

    group.finish();
}

fn bench_dump_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("dump_diff");

    for tables in [10, 100, 500] {
        let old = create_dump(tables, 8, false);
        let new = create_dump(tables, 8, true);

        group.throughput(Throughput::Bytes(old.len() as u64));
        group.bench_with_input(BenchmarkId::new("clean", tables), &old, |b, dump| {
            b.iter(|| black_box(clean_dump(dump)))
        });
        group.bench_with_input(BenchmarkId::new("identical", tables), &old, |b, dump| {
            b.iter(|| black_box(DumpDiff::between_dumps(dump, dump).is_empty()))
        });
        group.bench_with_input(BenchmarkId::new("render", tables), &tables, |b, _| {
            b.iter(|| black_box(DumpDiff::between_dumps(&old, &new).render()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_plan_changes, bench_dump_diff);

criterion_main!(benches);
