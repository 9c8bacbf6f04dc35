use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rolap_model::{
    AnsiDialect, Dialect, Hierarchy, HierarchyId, Level, MemberRef, Schema, SqliteDialect, Star,
    Value,
};
use rolap_native::{ConstraintCompiler, StarColumns, TupleList};

const STATES: usize = 50;

fn build_schema(cities_per_state: usize) -> (Schema, HierarchyId) {
    let mut star = Star::new("Sales", "sales_fact");
    star.add_table("store", "store", "sales_fact", "store_id", "store_id")
        .unwrap();
    let state = star.add_column("store", "store_state").unwrap();
    let city = star.add_column("store", "store_city").unwrap();
    let mut schema = Schema::new("Bench");
    let star_id = schema.add_star(star).unwrap();

    let mut store = Hierarchy::new("Store", "Store", star_id, true);
    store.add_level(Level::new("State", state)).unwrap();
    store.add_level(Level::new("City", city)).unwrap();
    for s in 0..STATES {
        // Every tenth state is unknown, so the NULL paths are exercised too.
        let state_key = if s % 10 == 9 {
            Value::Null
        } else {
            Value::from(format!("S{s:02}"))
        };
        for c in 0..cities_per_state {
            store
                .add_member_path(&[state_key.clone(), Value::from(format!("City {c}"))])
                .unwrap();
        }
    }
    let store = schema.add_hierarchy(store).unwrap();
    (schema, store)
}

fn bench_constraint_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("constraint_compile");
    for cities_per_state in [2usize, 20] {
        let (schema, store) = build_schema(cities_per_state);
        let cities: Vec<MemberRef> = schema
            .hierarchy(store)
            .level_members(2)
            .into_iter()
            .map(|m| MemberRef::new(store, m))
            .collect();
        let list = TupleList::from_members(cities.iter().copied());
        group.throughput(Throughput::Elements(cities.len() as u64));

        let dialects: [(&str, &dyn Dialect); 2] = [("ansi", &AnsiDialect), ("sqlite", &SqliteDialect)];
        for (name, dialect) in dialects {
            let compiler = ConstraintCompiler::new(&schema, dialect);
            let columns = StarColumns {
                star: schema.star(schema.hierarchy(store).star()),
                dialect,
            };
            group.bench_with_input(
                BenchmarkId::new(format!("{name}/in"), cities.len()),
                &list,
                |b, list| {
                    b.iter(|| {
                        let compiled = compiler.compile(list, false).unwrap();
                        black_box(compiled.predicate.to_sql(&columns, dialect));
                    })
                },
            );
            group.bench_with_input(
                BenchmarkId::new(format!("{name}/not_in"), cities.len()),
                &list,
                |b, list| {
                    b.iter(|| {
                        let compiled = compiler.compile(list, true).unwrap();
                        black_box(compiled.predicate.to_sql(&columns, dialect));
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_constraint_compile);
criterion_main!(benches);
