mod common;

use common::FoodMart;
use pretty_assertions::assert_eq;
use rolap_model::{MemberRef, Role, Value};
use rolap_native::{
    AlertLevel, ArithOp, BoolExpr, CompareOp, Definitions, EvalContext, MemberExpr, NativeConfig,
    NativeError, NativeEvaluator, NativeOutcome, Refusal, RefusalReason, SetExpr, SetMaterializer,
    ValueExpr,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn evaluator(fm: &FoodMart, config: NativeConfig) -> NativeEvaluator {
    NativeEvaluator::new(Arc::clone(&fm.schema), config, fm.executor.clone())
}

fn states(fm: &FoodMart) -> SetExpr {
    SetExpr::LevelMembers {
        hierarchy: fm.store,
        depth: 1,
    }
}

fn genders(fm: &FoodMart) -> SetExpr {
    SetExpr::LevelMembers {
        hierarchy: fm.gender,
        depth: 1,
    }
}

fn unit_sales(fm: &FoodMart) -> ValueExpr {
    ValueExpr::Measure(fm.unit_sales)
}

fn tuples(outcome: NativeOutcome) -> Vec<Vec<MemberRef>> {
    match outcome {
        NativeOutcome::Tuples(list) => list.iter().map(|t| t.to_vec()).collect(),
        NativeOutcome::Refused(refusal) => panic!("unexpected refusal: {refusal}"),
    }
}

fn refusal(outcome: NativeOutcome) -> Refusal {
    match outcome {
        NativeOutcome::Refused(refusal) => refusal,
        NativeOutcome::Tuples(list) => panic!("expected a refusal, got {} tuples", list.len()),
    }
}

fn state_names(fm: &FoodMart, outcome: NativeOutcome) -> Vec<String> {
    fm.names(tuples(outcome).into_iter().map(|t| t[0]))
}

#[test]
fn not_empty_filter_runs_one_statement_and_keeps_set_order() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = states(&fm).filter(BoolExpr::not_empty(unit_sales(&fm)));
    let ctx = EvalContext::new();

    assert_eq!(
        native.plan_sql(&expr, &ctx).unwrap().unwrap(),
        "SELECT \"store\".\"store_state\" AS \"c0\" FROM \"sales_fact\" AS \"sales_fact\", \"store\" AS \"store\" \
         WHERE \"sales_fact\".\"store_id\" = \"store\".\"store_id\" GROUP BY \"store\".\"store_state\" \
         HAVING SUM(\"sales_fact\".\"unit_sales\") IS NOT NULL ORDER BY \"c0\" ASC NULLS LAST"
    );
    let outcome = native.evaluate_native(&expr, &ctx).unwrap();
    assert_eq!(state_names(&fm, outcome), ["CA", "OR", "WA", "#null"]);

    // Second evaluation is a cache hit.
    native.evaluate_native(&expr, &ctx).unwrap();
    assert_eq!(native.sql_executions(), 1);
    assert_eq!(fm.executor.executions(), 1);
    assert_eq!(native.cache_stats().hits, 1);
}

#[test]
fn is_empty_filter_returns_the_complement_in_set_order() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = states(&fm).filter(BoolExpr::IsEmpty(unit_sales(&fm)));
    let outcome = native.evaluate_native(&expr, &EvalContext::new()).unwrap();
    assert_eq!(
        state_names(&fm, outcome),
        ["BC", "DF", "GU", "JA", "TX", "VE", "YU"]
    );
}

#[test]
fn excluding_a_state_keeps_the_null_state_unless_it_is_excluded_too() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let ctx = EvalContext::new();

    let not_wa = states(&fm).filter(
        BoolExpr::InSet {
            hierarchy: fm.store,
            members: vec![fm.state("WA")],
        }
        .not(),
    );
    let names = state_names(&fm, native.evaluate_native(&not_wa, &ctx).unwrap());
    assert_eq!(names.len(), 10);
    assert_eq!(names.last().map(String::as_str), Some("#null"));
    assert!(!names.contains(&"WA".to_string()));

    let neither = states(&fm).filter(
        BoolExpr::InSet {
            hierarchy: fm.store,
            members: vec![fm.state("WA"), fm.null_state()],
        }
        .not(),
    );
    let names = state_names(&fm, native.evaluate_native(&neither, &ctx).unwrap());
    assert_eq!(names.len(), 9);
    assert!(!names.contains(&"#null".to_string()));
}

#[test]
fn non_empty_crossjoin_returns_tuples_with_facts() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = SetExpr::CrossJoin(vec![genders(&fm), states(&fm)]);
    let rows = tuples(native.evaluate_native(&expr, &EvalContext::new().non_empty()).unwrap());
    let named: Vec<(String, String)> = rows
        .iter()
        .map(|t| (fm.names([t[0]])[0].clone(), fm.names([t[1]])[0].clone()))
        .collect();
    let expected: Vec<(String, String)> = [
        ("F", "CA"),
        ("F", "OR"),
        ("F", "WA"),
        ("M", "CA"),
        ("M", "WA"),
        ("M", "#null"),
    ]
    .iter()
    .map(|(g, s)| (g.to_string(), s.to_string()))
    .collect();
    assert_eq!(named, expected);
}

#[test]
fn slicer_members_restrict_the_crossjoin() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = SetExpr::CrossJoin(vec![genders(&fm), states(&fm)]);
    let ctx = EvalContext::new()
        .non_empty()
        .with_context([fm.member("Time", &[Value::from(1998)])]);
    let rows = tuples(native.evaluate_native(&expr, &ctx).unwrap());
    assert_eq!(rows, vec![vec![fm.member("Gender", &["F".into()]), fm.state("WA")]]);
}

#[test]
fn role_restrictions_are_enforced_against_fact_rows() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = SetExpr::CrossJoin(vec![genders(&fm), states(&fm)]);
    let role = Role::new("California").restrict(fm.store, vec![fm.state("CA").member]);
    let ctx = EvalContext::new().non_empty().with_role(role);
    let rows = tuples(native.evaluate_native(&expr, &ctx).unwrap());
    let states: Vec<MemberRef> = rows.iter().map(|t| t[1]).collect();
    assert_eq!(states, vec![fm.state("CA"), fm.state("CA")]);
}

#[test]
fn empty_members_hidden_by_the_role_stay_hidden() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let role = Role::new("California and BC")
        .restrict(fm.store, vec![fm.state("CA").member, fm.state("BC").member]);
    let ctx = EvalContext::new().with_role(role);

    let empty = states(&fm).filter(BoolExpr::IsEmpty(unit_sales(&fm)));
    assert_eq!(state_names(&fm, native.evaluate_native(&empty, &ctx).unwrap()), ["BC"]);

    let top = states(&fm).top_count(3, unit_sales(&fm));
    assert_eq!(
        state_names(&fm, native.evaluate_native(&top, &ctx).unwrap()),
        ["CA", "BC"]
    );
}

#[test]
fn top_count_results_are_cached_per_count() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let ctx = EvalContext::new().non_empty();
    let top2 = states(&fm).top_count(2, unit_sales(&fm));
    let top3 = states(&fm).top_count(3, unit_sales(&fm));

    let two = tuples(native.evaluate_native(&top2, &ctx).unwrap());
    let three = tuples(native.evaluate_native(&top3, &ctx).unwrap());
    assert_eq!(fm.names(two.iter().map(|t| t[0])), ["CA", "OR"]);
    assert_eq!(fm.names(three.iter().map(|t| t[0])), ["CA", "OR", "WA"]);
    assert_eq!(&three[..2], &two[..]);
    assert_eq!(native.cache_stats().entries, 2);
    assert_eq!(native.sql_executions(), 2);

    let sql = native.plan_sql(&top2, &ctx).unwrap().unwrap();
    assert!(sql.ends_with("ORDER BY \"c1\" DESC NULLS LAST, \"c0\" ASC NULLS LAST LIMIT 2"), "{sql}");
}

#[test]
fn top_count_pads_with_empty_members_outside_non_empty() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = states(&fm).top_count(5, unit_sales(&fm));
    let outcome = native.evaluate_native(&expr, &EvalContext::new()).unwrap();
    assert_eq!(state_names(&fm, outcome), ["CA", "OR", "WA", "#null", "BC"]);
}

#[test]
fn small_non_native_arguments_are_expanded_in_memory() {
    let fm = FoodMart::new();
    let picked = vec![fm.state("OR"), fm.state("CA")];
    let expr = SetExpr::Tuples(picked.iter().map(|m| vec![*m]).collect());
    let materialized = picked.clone();
    let materializer: Arc<dyn SetMaterializer> =
        Arc::new(move |_: &SetExpr, _: &EvalContext, _: usize| Some(materialized.clone()));

    let native = evaluator(&fm, NativeConfig::default()).with_materializer(Arc::clone(&materializer));
    assert!(matches!(
        native.evaluate_native(&expr, &EvalContext::new()).unwrap(),
        NativeOutcome::Refused(_)
    ));

    let config = NativeConfig {
        expand_non_native: true,
        ..NativeConfig::default()
    };
    let native = evaluator(&fm, config).with_materializer(materializer);
    let rows = tuples(native.evaluate_native(&expr, &EvalContext::new()).unwrap());
    // Member lists keep their own order.
    assert_eq!(rows, vec![vec![fm.state("OR")], vec![fm.state("CA")]]);
}

#[test]
fn current_member_of_the_evaluated_set_is_refused() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let expr = states(&fm).filter(BoolExpr::Compare(
        CompareOp::Gt,
        ValueExpr::Tuple {
            members: vec![MemberExpr::CurrentMember(fm.store)],
            measure: fm.unit_sales,
        },
        ValueExpr::Literal(Value::from(5)),
    ));
    let refused = refusal(native.evaluate_native(&expr, &EvalContext::new().non_empty()).unwrap());
    assert_eq!(
        refused.reason,
        RefusalReason::Unsupported(
            "expression references the current member of the set being evaluated".to_string()
        )
    );
    assert_eq!(fm.executor.executions(), 0);
}

#[test]
fn self_referencing_definitions_are_refused_without_looping() {
    let fm = FoodMart::new();
    let native = evaluator(&fm, NativeConfig::default());
    let definitions = Definitions::new()
        .with_calculated_measure(
            "Loop",
            ValueExpr::Arith(
                ArithOp::Add,
                Box::new(ValueExpr::CalculatedMeasure("Loop".to_string())),
                Box::new(ValueExpr::Literal(Value::from(1))),
            ),
        )
        .with_named_set(
            "Cycle",
            SetExpr::NamedSet("Cycle".to_string()).filter(BoolExpr::not_empty(unit_sales(&fm))),
        );
    let ctx = EvalContext::new().non_empty().with_definitions(definitions);

    let expr = states(&fm).filter(BoolExpr::Compare(
        CompareOp::Gt,
        ValueExpr::CalculatedMeasure("Loop".to_string()),
        ValueExpr::Literal(Value::from(0)),
    ));
    assert_eq!(
        refusal(native.evaluate_native(&expr, &ctx).unwrap()).reason,
        RefusalReason::Unsupported("calculated measure [Loop] refers to itself".to_string())
    );

    let expr = SetExpr::NamedSet("Cycle".to_string());
    assert_eq!(
        refusal(native.evaluate_native(&expr, &ctx).unwrap()).reason,
        RefusalReason::Unsupported("named set [Cycle] refers to itself".to_string())
    );
}

#[test]
fn unsupported_expressions_alert_once_until_flushed() {
    let fm = FoodMart::new();
    let config = NativeConfig {
        alert_native_unsupported: AlertLevel::Warn,
        ..NativeConfig::default()
    };
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let native = evaluator(&fm, config).with_observer(Arc::new(move |_: &Refusal| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let expr = states(&fm).filter(BoolExpr::Compare(
        CompareOp::Gt,
        ValueExpr::Function {
            name: "Rank".to_string(),
            args: Vec::new(),
        },
        ValueExpr::Literal(Value::from(3)),
    ));
    let ctx = EvalContext::new().non_empty();
    for _ in 0..3 {
        refusal(native.evaluate_native(&expr, &ctx).unwrap());
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    native.flush();
    refusal(native.evaluate_native(&expr, &ctx).unwrap());
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn error_alert_level_fails_the_evaluation() {
    let fm = FoodMart::new();
    let config = NativeConfig {
        alert_native_unsupported: AlertLevel::Error,
        ..NativeConfig::default()
    };
    let native = evaluator(&fm, config);
    let expr = states(&fm).filter(BoolExpr::Compare(
        CompareOp::Gt,
        ValueExpr::Function {
            name: "Rank".to_string(),
            args: Vec::new(),
        },
        ValueExpr::Literal(Value::from(3)),
    ));
    let err = native
        .evaluate_native(&expr, &EvalContext::new().non_empty())
        .unwrap_err();
    assert_eq!(
        err,
        NativeError::NativeEvaluationUnsupported {
            expression: rolap_native::describe(&fm.schema, &expr),
            reason: "Rank has no SQL translation".to_string(),
        }
    );

    // Disabled constructs are never alerted.
    let config = NativeConfig {
        alert_native_unsupported: AlertLevel::Error,
        enable_native_filter: false,
        ..NativeConfig::default()
    };
    let native = evaluator(&fm, config);
    let outcome = native.evaluate_native(&expr, &EvalContext::new()).unwrap();
    assert_eq!(
        refusal(outcome).reason,
        RefusalReason::FeatureDisabled("enable_native_filter")
    );
}

#[test]
fn result_limit_aborts_oversized_sets() {
    let fm = FoodMart::new();
    let config = NativeConfig {
        result_limit: 5,
        ..NativeConfig::default()
    };
    let native = evaluator(&fm, config);

    // 2 genders x 11 states can't fit: refused before any SQL.
    let expr = SetExpr::CrossJoin(vec![genders(&fm), states(&fm)]);
    let refused = refusal(native.evaluate_native(&expr, &EvalContext::new().non_empty()).unwrap());
    assert_eq!(
        refused.reason,
        RefusalReason::Unsupported("projected 22 rows exceed the result limit of 5".to_string())
    );
    assert_eq!(fm.executor.executions(), 0);
}

#[test]
fn concurrent_evaluations_share_one_statement() {
    let fm = FoodMart::with_delay(Duration::from_millis(50));
    let native = evaluator(&fm, NativeConfig::default());
    let expr = states(&fm).filter(BoolExpr::not_empty(unit_sales(&fm)));

    let results: Vec<Vec<Vec<MemberRef>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| tuples(native.evaluate_native(&expr, &EvalContext::new()).unwrap()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(fm.executor.executions(), 1);
    assert_eq!(native.cache_stats().misses, 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(results[0].len(), 4);
}
