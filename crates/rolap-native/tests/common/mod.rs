#![allow(dead_code)]

use rolap_model::{
    AggregateTable, Aggregator, ColumnId, Dialect, Hierarchy, HierarchyId, Level, MeasureId,
    MemberRef, Schema, Star, StarId, Value,
};
use rolap_native::{CancellationToken, NativeResult, SqlExecutor, SqliteExecutor};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stores: (store_id, state, city). Store 14 has no state.
pub const STORES: &[(i64, Option<&str>, &str)] = &[
    (1, Some("CA"), "Los Angeles"),
    (2, Some("CA"), "San Francisco"),
    (3, Some("OR"), "Portland"),
    (4, Some("OR"), "Salem"),
    (5, Some("WA"), "Seattle"),
    (6, Some("WA"), "Spokane"),
    (7, Some("BC"), "Vancouver"),
    (8, Some("DF"), "Mexico City"),
    (9, Some("GU"), "Guadalajara"),
    (10, Some("JA"), "Acapulco"),
    (11, Some("TX"), "Houston"),
    (12, Some("VE"), "Caracas"),
    (13, Some("YU"), "Merida"),
    (14, None, "Zagreb"),
];

/// Customers: (customer_id, gender, marital_status).
const CUSTOMERS: &[(i64, &str, &str)] = &[(1, "F", "M"), (2, "M", "S"), (3, "F", "S"), (4, "M", "M")];

/// Days: (time_id, the_year, quarter, month_of_year).
const DAYS: &[(i64, i64, &str, i64)] = &[
    (1, 1997, "Q1", 1),
    (2, 1997, "Q1", 2),
    (3, 1997, "Q2", 4),
    (4, 1998, "Q1", 1),
];

const FAMILIES: &[(i64, &str)] = &[(1, "Drink"), (2, "Food"), (3, "Non-Consumable")];

/// Sales: (time_id, store_id, customer_id, product_id, unit_sales).
///
/// Unit Sales by gender: F = 27, M = 10. By state: CA = 15, OR = 13, WA = 7, #null = 2.
const SALES: &[(i64, i64, i64, i64, i64)] = &[
    (1, 1, 1, 1, 10),
    (1, 1, 2, 2, 5),
    (2, 3, 3, 2, 7),
    (3, 5, 4, 3, 3),
    (4, 5, 1, 1, 4),
    (1, 14, 2, 2, 2),
    (3, 3, 1, 3, 6),
];

const DDL: &str = "
CREATE TABLE store (store_id INTEGER PRIMARY KEY, store_state TEXT, store_city TEXT);
CREATE TABLE customer (customer_id INTEGER PRIMARY KEY, gender TEXT, marital_status TEXT);
CREATE TABLE time_by_day (time_id INTEGER PRIMARY KEY, the_year INTEGER, quarter TEXT, month_of_year INTEGER);
CREATE TABLE product_class (product_class_id INTEGER PRIMARY KEY, product_family TEXT);
CREATE TABLE product (product_id INTEGER PRIMARY KEY, product_class_id INTEGER);
CREATE TABLE sales_fact (
    time_id INTEGER, store_id INTEGER, customer_id INTEGER, product_id INTEGER, unit_sales INTEGER
);
CREATE TABLE agg_c_14_sales_fact (
    the_year INTEGER, quarter TEXT, month_of_year INTEGER, product_family TEXT,
    customer_count INTEGER, unit_sales INTEGER, fact_count INTEGER
);
CREATE TABLE agg_g_ms_pcat_sales_fact (
    the_year INTEGER, quarter TEXT, gender TEXT, marital_status TEXT, product_family TEXT,
    customer_count INTEGER, unit_sales INTEGER, fact_count INTEGER
);
";

const AGG_C_14: &str = "
INSERT INTO agg_c_14_sales_fact VALUES
    (1997, 'Q1', 1, 'Drink', 1, 10, 1),
    (1997, 'Q1', 1, 'Food', 1, 7, 2),
    (1997, 'Q1', 2, 'Food', 1, 7, 1),
    (1997, 'Q2', 4, 'Non-Consumable', 2, 9, 2),
    (1998, 'Q1', 1, 'Drink', 1, 4, 1);
";

fn sql_text(value: Option<&str>) -> String {
    match value {
        Some(s) => format!("'{}'", s.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

fn fixture_sql() -> String {
    let mut sql = DDL.to_string();
    for (id, state, city) in STORES {
        sql.push_str(&format!(
            "INSERT INTO store VALUES ({id}, {}, {});\n",
            sql_text(*state),
            sql_text(Some(city))
        ));
    }
    for (id, gender, marital) in CUSTOMERS {
        sql.push_str(&format!("INSERT INTO customer VALUES ({id}, '{gender}', '{marital}');\n"));
    }
    for (id, year, quarter, month) in DAYS {
        sql.push_str(&format!(
            "INSERT INTO time_by_day VALUES ({id}, {year}, '{quarter}', {month});\n"
        ));
    }
    for (id, family) in FAMILIES {
        sql.push_str(&format!("INSERT INTO product_class VALUES ({id}, '{family}');\n"));
        sql.push_str(&format!("INSERT INTO product VALUES ({id}, {id});\n"));
    }
    for (time, store, customer, product, units) in SALES {
        sql.push_str(&format!(
            "INSERT INTO sales_fact VALUES ({time}, {store}, {customer}, {product}, {units});\n"
        ));
    }
    sql.push_str(AGG_C_14);
    sql
}

/// Wraps the SQLite executor, recording every statement and optionally slowing each one down.
#[derive(Debug)]
pub struct RecordingExecutor {
    inner: SqliteExecutor,
    statements: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingExecutor {
    pub fn new(inner: SqliteExecutor) -> Self {
        Self {
            inner,
            statements: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn executions(&self) -> usize {
        self.statements.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.statements.lock().unwrap().clear();
    }

    /// Run fixture DDL/DML directly, without recording it.
    pub fn execute_batch(&self, sql: &str) {
        self.inner.execute_batch(sql).unwrap();
    }
}

impl SqlExecutor for RecordingExecutor {
    fn dialect(&self) -> &dyn Dialect {
        self.inner.dialect()
    }

    fn execute(
        &self,
        sql: &str,
        cancel: &CancellationToken,
        on_row: &mut dyn FnMut(&[Value]) -> ControlFlow<()>,
    ) -> NativeResult<()> {
        self.statements.lock().unwrap().push(sql.to_string());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.execute(sql, cancel, on_row)
    }
}

/// A small FoodMart-shaped schema over an in-memory SQLite database.
pub struct FoodMart {
    pub schema: Arc<Schema>,
    pub executor: Arc<RecordingExecutor>,
    pub star: StarId,
    pub store: HierarchyId,
    pub gender: HierarchyId,
    pub marital_status: HierarchyId,
    pub time: HierarchyId,
    pub product: HierarchyId,
    pub state_col: ColumnId,
    pub city_col: ColumnId,
    pub gender_col: ColumnId,
    pub marital_col: ColumnId,
    pub year_col: ColumnId,
    pub quarter_col: ColumnId,
    pub month_col: ColumnId,
    pub family_col: ColumnId,
    pub unit_sales: MeasureId,
    pub sales_count: MeasureId,
    pub customer_count: MeasureId,
}

impl FoodMart {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        let sqlite = SqliteExecutor::open_in_memory().unwrap();
        sqlite.execute_batch(&fixture_sql()).unwrap();
        let executor = Arc::new(RecordingExecutor::new(sqlite).with_delay(delay));

        let mut star = Star::new("Sales", "sales_fact");
        star.add_table("store", "store", "sales_fact", "store_id", "store_id")
            .unwrap();
        star.add_table("customer", "customer", "sales_fact", "customer_id", "customer_id")
            .unwrap();
        star.add_table("time_by_day", "time_by_day", "sales_fact", "time_id", "time_id")
            .unwrap();
        star.add_table("product", "product", "sales_fact", "product_id", "product_id")
            .unwrap();
        star.add_table(
            "product_class",
            "product_class",
            "product",
            "product_class_id",
            "product_class_id",
        )
        .unwrap();
        let state_col = star.add_column("store", "store_state").unwrap();
        let city_col = star.add_column("store", "store_city").unwrap();
        let gender_col = star.add_column("customer", "gender").unwrap();
        let marital_col = star.add_column("customer", "marital_status").unwrap();
        let year_col = star.add_column("time_by_day", "the_year").unwrap();
        let quarter_col = star.add_column("time_by_day", "quarter").unwrap();
        let month_col = star.add_column("time_by_day", "month_of_year").unwrap();
        let family_col = star.add_column("product_class", "product_family").unwrap();
        let unit_sales_col = star.add_column("sales_fact", "unit_sales").unwrap();
        let customer_id_col = star.add_column("sales_fact", "customer_id").unwrap();
        let unit_sales = star
            .add_measure("Unit Sales", Aggregator::Sum, Some(unit_sales_col))
            .unwrap();
        let sales_count = star.add_measure("Sales Count", Aggregator::Count, None).unwrap();
        let customer_count = star
            .add_distinct_count_measure("Customer Count", customer_id_col, "Customers")
            .unwrap();

        let mut schema = Schema::new("FoodMart");
        let star_id = schema.add_star(star).unwrap();

        let mut store = Hierarchy::new("Store", "Store", star_id, true);
        store.add_level(Level::new("State", state_col).with_unique_members(true))
            .unwrap();
        store.add_level(Level::new("City", city_col)).unwrap();
        for (_, state, city) in STORES {
            store
                .add_member_path(&[Value::from(*state), Value::from(*city)])
                .unwrap();
        }

        let mut gender = Hierarchy::new("Gender", "Customers", star_id, true);
        gender
            .add_level(Level::new("Gender", gender_col).with_unique_members(true))
            .unwrap();
        let mut marital = Hierarchy::new("Marital Status", "Customers", star_id, true);
        marital
            .add_level(Level::new("Marital Status", marital_col).with_unique_members(true))
            .unwrap();
        for key in ["F", "M"] {
            gender.add_member(None, key).unwrap();
        }
        for key in ["M", "S"] {
            marital.add_member(None, key).unwrap();
        }

        let mut time = Hierarchy::new("Time", "Time", star_id, false);
        time.add_level(Level::new("Year", year_col).with_unique_members(true))
            .unwrap();
        time.add_level(Level::new("Quarter", quarter_col)).unwrap();
        time.add_level(Level::new("Month", month_col)).unwrap();
        for (_, year, quarter, month) in DAYS {
            time.add_member_path(&[Value::from(*year), Value::from(*quarter), Value::from(*month)])
                .unwrap();
        }

        let mut product = Hierarchy::new("Product", "Product", star_id, true);
        product
            .add_level(Level::new("Product Family", family_col).with_unique_members(true))
            .unwrap();
        for (_, family) in FAMILIES {
            product.add_member_path(&[Value::from(*family)]).unwrap();
        }

        let store = schema.add_hierarchy(store).unwrap();
        let gender = schema.add_hierarchy(gender).unwrap();
        let marital_status = schema.add_hierarchy(marital).unwrap();
        let time = schema.add_hierarchy(time).unwrap();
        let product = schema.add_hierarchy(product).unwrap();

        let base = schema.star(star_id);
        let agg_c_14 = AggregateTable::new("agg_c_14_sales_fact", base)
            .with_column(year_col, "the_year")
            .with_column(quarter_col, "quarter")
            .with_column(month_col, "month_of_year")
            .with_column(family_col, "product_family")
            .with_measure(base, customer_count, "customer_count")
            .with_measure(base, unit_sales, "unit_sales")
            .with_fact_count("fact_count");
        let agg_g_ms_pcat = AggregateTable::new("agg_g_ms_pcat_sales_fact", base)
            .with_column(year_col, "the_year")
            .with_column(quarter_col, "quarter")
            .with_column(gender_col, "gender")
            .with_column(marital_col, "marital_status")
            .with_column(family_col, "product_family")
            .with_measure(base, customer_count, "customer_count")
            .with_measure(base, unit_sales, "unit_sales")
            .with_fact_count("fact_count");
        schema.add_aggregate_table(agg_c_14).unwrap();
        schema.add_aggregate_table(agg_g_ms_pcat).unwrap();

        Self {
            schema: Arc::new(schema),
            executor,
            star: star_id,
            store,
            gender,
            marital_status,
            time,
            product,
            state_col,
            city_col,
            gender_col,
            marital_col,
            year_col,
            quarter_col,
            month_col,
            family_col,
            unit_sales,
            sales_count,
            customer_count,
        }
    }

    pub fn member(&self, hierarchy: &str, keys: &[Value]) -> MemberRef {
        self.schema.member(hierarchy, keys).unwrap()
    }

    pub fn state(&self, state: &str) -> MemberRef {
        self.member("Store", &[Value::from(state)])
    }

    pub fn null_state(&self) -> MemberRef {
        self.member("Store", &[Value::Null])
    }

    /// Member names, in order.
    pub fn names(&self, members: impl IntoIterator<Item = MemberRef>) -> Vec<String> {
        members
            .into_iter()
            .map(|m| self.schema.hierarchy(m.hierarchy).member(m.member).name.clone())
            .collect()
    }
}
