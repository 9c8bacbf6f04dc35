mod common;

use common::FoodMart;
use pretty_assertions::assert_eq;
use rolap_model::Value;
use rolap_native::{
    AggregationManager, CancellationToken, CellRequest, ConstraintCompiler, ExecutionContext,
    NativeConfig, NativeError, Predicate, SqlExecutor, TupleList,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn manager(fm: &FoodMart, config: NativeConfig) -> AggregationManager {
    AggregationManager::new(Arc::clone(&fm.schema), config, fm.executor.clone())
}

fn with_aggregates() -> NativeConfig {
    NativeConfig {
        use_aggregates: true,
        ..NativeConfig::default()
    }
}

#[test]
fn repeated_cell_requests_issue_one_statement() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let exec = ExecutionContext::new();
    let request = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "F");

    assert_eq!(cells.get_cell_from_cache(&request), None);
    cells.load_cells(&[request.clone()], &exec).unwrap();
    cells.load_cells(&[request.clone()], &exec).unwrap();
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(27)));
    assert_eq!(cells.sql_executions(), 1);
    assert_eq!(fm.executor.executions(), 1);
}

#[test]
fn requests_of_one_shape_share_a_group_by() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let exec = ExecutionContext::new();
    let requests = vec![
        CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "F"),
        CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "M"),
        CellRequest::new(fm.star, fm.sales_count).with_value(fm.gender_col, "F"),
    ];

    assert_eq!(
        cells.batch_sql(&requests, &exec).unwrap(),
        vec![
            "SELECT \"customer\".\"gender\" AS \"c0\", SUM(\"sales_fact\".\"unit_sales\") AS \"c1\", COUNT(*) AS \"c2\" \
             FROM \"sales_fact\" AS \"sales_fact\", \"customer\" AS \"customer\" \
             WHERE \"sales_fact\".\"customer_id\" = \"customer\".\"customer_id\" \
             AND \"customer\".\"gender\" IN ('F', 'M') GROUP BY \"customer\".\"gender\""
                .to_string()
        ]
    );
    cells.load_cells(&requests, &exec).unwrap();
    assert_eq!(fm.executor.executions(), 1);

    let values: Vec<Option<Value>> = requests.iter().map(|r| cells.get_cell_from_cache(r)).collect();
    assert_eq!(
        values,
        vec![Some(Value::from(27)), Some(Value::from(10)), Some(Value::from(4))]
    );
    // Loaded alongside the others: a covered cell, not a miss.
    let m_count = CellRequest::new(fm.star, fm.sales_count).with_value(fm.gender_col, "M");
    assert_eq!(cells.get_cell_from_cache(&m_count), Some(Value::from(3)));
}

#[test]
fn covered_cells_without_rows_are_empty() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let exec = ExecutionContext::new();
    let sold = CellRequest::new(fm.star, fm.unit_sales)
        .with_value(fm.gender_col, "M")
        .with_value(fm.state_col, "WA");
    let unsold = CellRequest::new(fm.star, fm.unit_sales)
        .with_value(fm.gender_col, "F")
        .with_value(fm.state_col, "BC");
    cells.load_cells(&[sold.clone(), unsold.clone()], &exec).unwrap();
    assert_eq!(cells.get_cell_from_cache(&sold), Some(Value::from(3)));
    assert_eq!(cells.get_cell_from_cache(&unsold), Some(Value::Null));
}

#[test]
fn null_coordinates_select_the_null_member() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let request = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.state_col, Value::Null);
    cells.load_cells(&[request.clone()], &ExecutionContext::new()).unwrap();
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(2)));
}

#[test]
fn compound_member_predicates_constrain_the_batch() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let dialect = fm.executor.dialect();
    let west = ConstraintCompiler::new(&fm.schema, dialect)
        .compile(&TupleList::from_members([fm.state("CA"), fm.state("OR")]), false)
        .unwrap();
    let request = CellRequest::new(fm.star, fm.unit_sales)
        .with_value(fm.gender_col, "F")
        .with_predicate(fm.state_col, west.predicate);
    cells.load_cells(&[request.clone()], &ExecutionContext::new()).unwrap();
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(23)));

    // Same coordinates without the predicate are a different batch.
    let plain = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "F");
    assert_eq!(cells.get_cell_from_cache(&plain), None);
}

#[test]
fn single_value_predicates_are_answered_from_grouped_segments() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let by_value = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "M");
    cells.load_cells(&[by_value], &ExecutionContext::new()).unwrap();

    let by_predicate = CellRequest::new(fm.star, fm.unit_sales)
        .with_predicate(fm.gender_col, Predicate::Eq(fm.gender_col, Value::from("M")));
    assert_eq!(cells.get_cell_from_cache(&by_predicate), Some(Value::from(10)));
    cells.load_cells(&[by_predicate], &ExecutionContext::new()).unwrap();
    assert_eq!(fm.executor.executions(), 1);
}

#[test]
fn flush_forgets_loaded_segments() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let exec = ExecutionContext::new();
    let request = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "M");
    cells.load_cells(&[request.clone()], &exec).unwrap();
    cells.flush();
    assert_eq!(cells.get_cell_from_cache(&request), None);
    cells.load_cells(&[request.clone()], &exec).unwrap();
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(10)));
    assert_eq!(fm.executor.executions(), 2);
}

#[test]
fn flush_during_a_load_discards_its_segment() {
    let fm = FoodMart::with_delay(Duration::from_millis(300));
    let cells = manager(&fm, NativeConfig::default());
    let request = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "F");

    std::thread::scope(|scope| {
        let loading = scope.spawn(|| cells.load_cells(&[request.clone()], &ExecutionContext::new()));
        std::thread::sleep(Duration::from_millis(100));
        cells.flush();
        loading.join().unwrap().unwrap();
    });
    assert_eq!(cells.get_cell_from_cache(&request), None);
    assert_eq!(cells.cache_stats().entries, 0);

    cells.load_cells(&[request.clone()], &ExecutionContext::new()).unwrap();
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(27)));
    assert_eq!(fm.executor.executions(), 2);
}

#[test]
fn cancelled_executions_load_nothing() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let exec = ExecutionContext::new();
    exec.cancel.cancel();
    let request = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "M");
    assert_eq!(cells.load_cells(&[request.clone()], &exec), Err(NativeError::Cancelled));
    assert_eq!(cells.get_cell_from_cache(&request), None);
    assert_eq!(fm.executor.executions(), 0);
}

#[test]
fn result_limit_fails_oversized_batches() {
    let fm = FoodMart::new();
    let config = NativeConfig {
        result_limit: 1,
        ..NativeConfig::default()
    };
    let cells = manager(&fm, config);
    let requests = vec![
        CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "F"),
        CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "M"),
    ];
    let err = cells
        .load_cells(&requests, &ExecutionContext::new())
        .unwrap_err();
    assert!(matches!(err, NativeError::ResourceLimitExceeded { limit: 1, .. }), "{err:?}");
    assert_eq!(cells.get_cell_from_cache(&requests[0]), None);
}

#[test]
fn concurrent_loads_of_one_batch_share_one_statement() {
    let fm = FoodMart::with_delay(Duration::from_millis(50));
    let cells = manager(&fm, NativeConfig::default());
    let request = CellRequest::new(fm.star, fm.unit_sales).with_value(fm.gender_col, "F");

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                cells
                    .load_cells(&[request.clone()], &ExecutionContext::new())
                    .unwrap()
            });
        }
    });
    assert_eq!(fm.executor.executions(), 1);
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(27)));
}

#[test]
fn distinct_count_is_not_answered_from_a_coarser_aggregate() {
    let fm = FoodMart::new();
    let cells = manager(&fm, with_aggregates());
    let matcher = cells.matcher();
    let required = BTreeSet::from([fm.year_col, fm.quarter_col, fm.month_col, fm.family_col]);
    let measures = BTreeSet::from([fm.customer_count]);
    let tables: Vec<_> = fm.schema.aggregate_tables(fm.star).collect();
    let by_name = |name: &str| tables.iter().find(|t| t.name() == name).unwrap();

    assert_eq!(
        matcher.check(by_name("agg_g_ms_pcat_sales_fact"), &required, &BTreeSet::new(), &measures),
        Err("missing column time_by_day.month_of_year".to_string())
    );
    assert_eq!(
        matcher.check(by_name("agg_c_14_sales_fact"), &required, &BTreeSet::new(), &measures),
        Ok(())
    );

    let request = CellRequest::new(fm.star, fm.customer_count)
        .with_value(fm.year_col, 1997)
        .with_value(fm.quarter_col, "Q1")
        .with_value(fm.month_col, 1)
        .with_value(fm.family_col, "Food");
    let exec = ExecutionContext::new();
    let sql = cells.batch_sql(&[request.clone()], &exec).unwrap();
    assert!(sql[0].contains("FROM \"agg_c_14_sales_fact\""), "{}", sql[0]);
    assert!(sql[0].contains("SUM(\"agg_c_14_sales_fact\".\"customer_count\")"), "{}", sql[0]);

    cells.load_cells(&[request.clone()], &exec).unwrap();
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(1)));
    // The row count is read once and memoized.
    let statements = fm.executor.statements();
    let counts = statements
        .iter()
        .filter(|s| s.starts_with("SELECT COUNT(*) FROM"))
        .count();
    assert_eq!(counts, 1);
    assert_eq!(cells.matcher().row_count_stats().misses, 1);
}

#[test]
fn distinct_count_rolls_up_only_along_its_own_dimension() {
    let fm = FoodMart::new();
    let cells = manager(&fm, with_aggregates());
    let required = BTreeSet::from([fm.year_col, fm.quarter_col, fm.family_col]);
    let measures = BTreeSet::from([fm.customer_count]);

    // agg_c_14 would sum customer counts across months; agg_g_ms_pcat only collapses customer
    // attributes.
    let chosen = cells
        .matcher()
        .choose(
            fm.star,
            &required,
            &BTreeSet::new(),
            &measures,
            fm.executor.as_ref(),
            &CancellationToken::new(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(chosen.name(), "agg_g_ms_pcat_sales_fact");
}

#[test]
fn distinct_count_filtered_on_another_dimension_reads_the_fact_table() {
    let fm = FoodMart::new();
    // Customer 2 also buys Food in February, so both Q1 months count customer 2.
    fm.executor.execute_batch(
        "INSERT INTO sales_fact VALUES (2, 1, 2, 2, 1);
         UPDATE agg_c_14_sales_fact SET customer_count = 2, unit_sales = 8, fact_count = 2
          WHERE the_year = 1997 AND month_of_year = 2 AND product_family = 'Food';",
    );
    let cells = manager(&fm, with_aggregates());
    let months = Predicate::in_values(fm.month_col, [Value::from(1), Value::from(2)]);
    let request = CellRequest::new(fm.star, fm.customer_count)
        .with_value(fm.year_col, 1997)
        .with_value(fm.quarter_col, "Q1")
        .with_value(fm.family_col, "Food")
        .with_predicate(fm.month_col, months);

    let exec = ExecutionContext::new();
    let sql = cells.batch_sql(&[request.clone()], &exec).unwrap();
    assert!(!sql[0].contains("agg_c_14_sales_fact"), "{}", sql[0]);
    assert!(sql[0].contains("COUNT(DISTINCT \"sales_fact\".\"customer_id\")"), "{}", sql[0]);

    cells.load_cells(&[request.clone()], &exec).unwrap();
    // Customers 2 and 3; summing the monthly counts would give 3.
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(2)));
}

#[test]
fn aggregates_are_ignored_unless_enabled() {
    let fm = FoodMart::new();
    let cells = manager(&fm, NativeConfig::default());
    let request = CellRequest::new(fm.star, fm.customer_count)
        .with_value(fm.year_col, 1997)
        .with_value(fm.family_col, "Food");
    let sql = cells
        .batch_sql(&[request.clone()], &ExecutionContext::new())
        .unwrap();
    assert!(sql[0].contains("COUNT(DISTINCT \"sales_fact\".\"customer_id\")"), "{}", sql[0]);
    assert!(sql[0].contains("\"product_class\" AS \"product_class\""), "{}", sql[0]);

    cells.load_cells(&[request.clone()], &ExecutionContext::new()).unwrap();
    // Food in 1997: customers 2 and 3.
    assert_eq!(cells.get_cell_from_cache(&request), Some(Value::from(2)));
}
