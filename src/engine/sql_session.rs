use regex::RegexBuilder;
use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::debug;

use crate::utils::{
    error::{QueryError, TabulaResult},
    types::{compare_values, dedupe_column_names, parse_datetime, Table, Value, ValueKey},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max"];

/// Ephemeral SQL context over registered in-memory tables
///
/// Registrations live exactly as long as the session; dropping it releases
/// every table it holds.
pub struct EmbeddedSession {
    id: u64,
    tables: HashMap<String, Arc<Table>>,
}

impl EmbeddedSession {
    pub fn open() -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(session = id, "Embedded session opened");
        Self {
            id,
            tables: HashMap::new(),
        }
    }

    /// Make `table` queryable as `alias`, replacing any earlier registration
    pub fn register(&mut self, alias: &str, table: Arc<Table>) {
        self.tables.insert(alias.to_string(), table);
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one `SELECT` statement against the registered tables
    pub fn execute(&self, sql: &str) -> TabulaResult<Table> {
        let statement = parse_statement(sql)?;
        let query = match statement {
            Statement::Query(query) => query,
            other => {
                return Err(QueryError::UnsupportedSql(format!(
                    "Only SELECT statements are supported, got: {}",
                    other
                ))
                .into())
            }
        };
        debug!(session = self.id, sql, "Executing embedded query");
        self.execute_query(&query)
    }

    fn resolve_table(&self, select: &Select) -> TabulaResult<&Table> {
        let [from] = select.from.as_slice() else {
            return Err(QueryError::UnsupportedSql("Exactly one table is required in FROM".to_string()).into());
        };
        if !from.joins.is_empty() {
            return Err(QueryError::UnsupportedSql("JOIN is not supported".to_string()).into());
        }
        let TableFactor::Table { name, .. } = &from.relation else {
            return Err(QueryError::UnsupportedSql("Only plain table references are supported in FROM".to_string()).into());
        };
        let alias = name.0.last().map(|ident| ident.value.clone()).unwrap_or_default();

        self.tables
            .get(&alias)
            .or_else(|| {
                self.tables
                    .iter()
                    .find(|(registered, _)| registered.eq_ignore_ascii_case(&alias))
                    .map(|(_, table)| table)
            })
            .map(|table| table.as_ref())
            .ok_or_else(|| QueryError::UnknownTable(alias).into())
    }

    fn execute_query(&self, query: &Query) -> TabulaResult<Table> {
        if query.with.is_some() {
            return Err(QueryError::UnsupportedSql("WITH clauses are not supported".to_string()).into());
        }
        if query.fetch.is_some() {
            return Err(QueryError::UnsupportedSql("FETCH is not supported".to_string()).into());
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(QueryError::UnsupportedSql("Only simple SELECT bodies are supported".to_string()).into());
        };
        let table = self.resolve_table(select)?;

        let mut candidates: Vec<usize> = Vec::with_capacity(table.row_count());
        for row in 0..table.row_count() {
            let keep = match &select.selection {
                Some(predicate) => is_true(&eval(predicate, Scope::Row { table, row })?),
                None => true,
            };
            if keep {
                candidates.push(row);
            }
        }

        let group_exprs: &[Expr] = match &select.group_by {
            GroupByExpr::Expressions(exprs) => exprs,
            GroupByExpr::All => {
                return Err(QueryError::UnsupportedSql("GROUP BY ALL is not supported".to_string()).into())
            }
        };
        let aggregated = !group_exprs.is_empty()
            || select.having.is_some()
            || select.projection.iter().any(|item| match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => contains_aggregate(expr),
                _ => false,
            });

        let scopes: Vec<Vec<usize>> = if aggregated {
            let mut groups = group_rows(table, &candidates, group_exprs)?;
            if let Some(having) = &select.having {
                let mut kept = Vec::with_capacity(groups.len());
                for rows in groups {
                    if is_true(&eval(having, Scope::Group { table, rows: &rows })?) {
                        kept.push(rows);
                    }
                }
                groups = kept;
            }
            groups
        } else {
            candidates.into_iter().map(|row| vec![row]).collect()
        };

        let names = output_names(table, &select.projection)?;
        let mut output: Vec<(Vec<Value>, Vec<Value>)> = Vec::with_capacity(scopes.len());
        for rows in &scopes {
            let scope = if aggregated {
                Scope::Group { table, rows }
            } else {
                Scope::Row { table, row: rows[0] }
            };
            let values = project(&select.projection, scope)?;
            let mut keys = Vec::with_capacity(query.order_by.len());
            for order in &query.order_by {
                keys.push(order_key(&order.expr, &names, &values, scope)?);
            }
            output.push((values, keys));
        }

        match &select.distinct {
            None => {}
            Some(Distinct::Distinct) => {
                let mut seen = HashSet::new();
                output.retain(|(values, _)| seen.insert(values.iter().cloned().map(ValueKey).collect::<Vec<_>>()));
            }
            Some(Distinct::On(_)) => {
                return Err(QueryError::UnsupportedSql("DISTINCT ON is not supported".to_string()).into())
            }
        }

        if !query.order_by.is_empty() {
            output.sort_by(|(_, a), (_, b)| {
                query
                    .order_by
                    .iter()
                    .zip(a.iter().zip(b))
                    .map(|(order, (x, y))| compare_sort_keys(x, y, order.asc.unwrap_or(true), order.nulls_first))
                    .find(|ordering| *ordering != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let offset = match &query.offset {
            Some(offset) => literal_count(&offset.value, "OFFSET")?,
            None => 0,
        };
        let limit = match &query.limit {
            Some(limit) => literal_count(limit, "LIMIT")?,
            None => usize::MAX,
        };
        let rows: Vec<Vec<Value>> = output.into_iter().skip(offset).take(limit).map(|(values, _)| values).collect();

        Table::from_rows(dedupe_column_names(names), rows)
    }
}

impl Drop for EmbeddedSession {
    fn drop(&mut self) {
        let released = self.tables.len();
        self.tables.clear();
        debug!(session = self.id, released, "Embedded session closed");
    }
}

/// Parse with the PostgreSQL, MySQL, SQLite and generic dialects in turn
fn parse_statement(sql: &str) -> TabulaResult<Statement> {
    let dialects: [&dyn Dialect; 4] = [&PostgreSqlDialect {}, &MySqlDialect {}, &SQLiteDialect {}, &GenericDialect {}];
    let mut first_error = None;

    for dialect in dialects {
        match Parser::parse_sql(dialect, sql) {
            Ok(statements) => {
                if statements.len() > 1 {
                    return Err(QueryError::UnsupportedSql("Only one statement per call is supported".to_string()).into());
                }
                return statements
                    .into_iter()
                    .next()
                    .ok_or_else(|| QueryError::InvalidSql("Empty statement".to_string()).into());
            }
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    Err(QueryError::InvalidSql(first_error.unwrap_or_else(|| "Failed to parse SQL".to_string())).into())
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Row { table: &'a Table, row: usize },
    Group { table: &'a Table, rows: &'a [usize] },
}

impl<'a> Scope<'a> {
    fn table(&self) -> &'a Table {
        match self {
            Scope::Row { table, .. } | Scope::Group { table, .. } => table,
        }
    }

    fn representative_row(&self) -> Option<usize> {
        match self {
            Scope::Row { row, .. } => Some(*row),
            Scope::Group { rows, .. } => rows.first().copied(),
        }
    }
}

fn column_index(table: &Table, name: &str) -> TabulaResult<usize> {
    table
        .column_index(name)
        .or_else(|| table.columns().iter().position(|c| c.name.eq_ignore_ascii_case(name)))
        .ok_or_else(|| QueryError::UnknownColumn(name.to_string()).into())
}

fn column_value(scope: Scope<'_>, name: &str) -> TabulaResult<Value> {
    let table = scope.table();
    let index = column_index(table, name)?;
    Ok(scope
        .representative_row()
        .map(|row| table.columns()[index].values[row].clone())
        .unwrap_or(Value::Null))
}

/// Partition rows by the GROUP BY expressions, groups in order of first appearance
fn group_rows(table: &Table, rows: &[usize], exprs: &[Expr]) -> TabulaResult<Vec<Vec<usize>>> {
    if exprs.is_empty() {
        return Ok(vec![rows.to_vec()]);
    }
    let mut index: HashMap<Vec<ValueKey>, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for &row in rows {
        let key = exprs
            .iter()
            .map(|expr| eval(expr, Scope::Row { table, row }).map(ValueKey))
            .collect::<TabulaResult<Vec<_>>>()?;
        match index.get(&key) {
            Some(&slot) => groups[slot].push(row),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![row]);
            }
        }
    }
    Ok(groups)
}

fn output_names(table: &Table, projection: &[SelectItem]) -> TabulaResult<Vec<String>> {
    let mut names = Vec::new();
    for item in projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => names.extend(table.column_names()),
            SelectItem::ExprWithAlias { alias, .. } => names.push(alias.value.clone()),
            SelectItem::UnnamedExpr(expr) => names.push(match expr {
                Expr::Identifier(ident) => table.columns()[column_index(table, &ident.value)?].name.clone(),
                Expr::CompoundIdentifier(idents) => match idents.last() {
                    Some(ident) => table.columns()[column_index(table, &ident.value)?].name.clone(),
                    None => expr.to_string(),
                },
                other => other.to_string(),
            }),
        }
    }
    Ok(names)
}

fn project(projection: &[SelectItem], scope: Scope<'_>) -> TabulaResult<Vec<Value>> {
    let mut values = Vec::with_capacity(projection.len());
    for item in projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                let table = scope.table();
                match scope.representative_row() {
                    Some(row) => values.extend(table.row(row)),
                    None => values.extend(std::iter::repeat(Value::Null).take(table.column_count())),
                }
            }
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => values.push(eval(expr, scope)?),
        }
    }
    Ok(values)
}

/// Sort key: an output column by name or 1-based position, else the expression itself
fn order_key(expr: &Expr, names: &[String], values: &[Value], scope: Scope<'_>) -> TabulaResult<Value> {
    match expr {
        Expr::Identifier(ident) => {
            if let Some(position) = names.iter().position(|n| n == &ident.value) {
                return Ok(values[position].clone());
            }
        }
        Expr::Value(SqlValue::Number(n, _)) => {
            let position: usize = n
                .parse()
                .map_err(|_| QueryError::InvalidSql(format!("Invalid ORDER BY position: {}", n)))?;
            return values
                .get(position.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| QueryError::InvalidSql(format!("ORDER BY position {} is out of range", n)).into());
        }
        _ => {}
    }
    eval(expr, scope)
}

fn compare_sort_keys(a: &Value, b: &Value, ascending: bool, nulls_first: Option<bool>) -> Ordering {
    let nulls_first = nulls_first.unwrap_or(!ascending);
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => if nulls_first { Ordering::Less } else { Ordering::Greater },
        (false, true) => if nulls_first { Ordering::Greater } else { Ordering::Less },
        (false, false) => {
            let ordering = compare_values(a, b);
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        }
    }
}

fn literal_count(expr: &Expr, clause: &str) -> TabulaResult<usize> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n
            .parse()
            .map_err(|_| QueryError::InvalidSql(format!("Invalid {} value: {}", clause, n)).into()),
        _ => Err(QueryError::UnsupportedSql(format!("{} must be a non-negative integer literal", clause)).into()),
    }
}

fn function_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Function(func) => func.name.0.last().map(|ident| ident.value.to_lowercase()),
        _ => None,
    }
}

fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(func) => {
            function_name(expr).map_or(false, |name| AGGREGATES.contains(&name.as_str()))
                || func.args.iter().any(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(inner))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(inner),
                        ..
                    } => contains_aggregate(inner),
                    _ => false,
                })
        }
        Expr::BinaryOp { left, right, .. } => contains_aggregate(left) || contains_aggregate(right),
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::IsNull(expr) | Expr::IsNotNull(expr) => {
            contains_aggregate(expr)
        }
        Expr::Between { expr, low, high, .. } => {
            contains_aggregate(expr) || contains_aggregate(low) || contains_aggregate(high)
        }
        Expr::InList { expr, list, .. } => contains_aggregate(expr) || list.iter().any(contains_aggregate),
        _ => false,
    }
}

fn is_true(value: &Value) -> bool {
    truth(value) == Some(true)
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Boolean(b) => Some(*b),
        v if v.is_null() => None,
        other => other.as_f64().map(|f| f != 0.0),
    }
}

fn literal(value: &SqlValue) -> TabulaResult<Value> {
    match value {
        SqlValue::Number(n, _) => Ok(n
            .parse::<i64>()
            .map(Value::Integer)
            .or_else(|_| n.parse::<f64>().map(Value::Float))
            .map_err(|_| QueryError::InvalidSql(format!("Invalid number: {}", n)))?),
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => Ok(Value::Text(s.clone())),
        SqlValue::Boolean(b) => Ok(Value::Boolean(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(QueryError::UnsupportedSql(format!("Literal {}", other)).into()),
    }
}

fn eval(expr: &Expr, scope: Scope<'_>) -> TabulaResult<Value> {
    match expr {
        Expr::Identifier(ident) => column_value(scope, &ident.value),
        Expr::CompoundIdentifier(idents) => match idents.last() {
            Some(ident) => column_value(scope, &ident.value),
            None => Err(QueryError::InvalidSql("Empty identifier".to_string()).into()),
        },
        Expr::Value(value) => literal(value),
        Expr::Nested(inner) => eval(inner, scope),
        Expr::IsNull(inner) => Ok(Value::Boolean(eval(inner, scope)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Value::Boolean(!eval(inner, scope)?.is_null())),
        Expr::UnaryOp { op, expr } => {
            let value = eval(expr, scope)?;
            match op {
                UnaryOperator::Not => Ok(truth(&value).map(|b| Value::Boolean(!b)).unwrap_or(Value::Null)),
                UnaryOperator::Minus => Ok(match value {
                    Value::Integer(i) => i.checked_neg().map(Value::Integer).unwrap_or(Value::Null),
                    other => other.as_f64().map(|f| Value::Float(-f)).unwrap_or(Value::Null),
                }),
                UnaryOperator::Plus => Ok(value),
                other => Err(QueryError::UnsupportedSql(format!("Unary operator {}", other)).into()),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let lhs = eval(left, scope)?;
            let rhs = eval(right, scope)?;
            binary(&lhs, op, &rhs)
        }
        Expr::InList { expr, list, negated } => {
            let value = eval(expr, scope)?;
            if value.is_null() {
                return Ok(Value::Null);
            }
            let mut found = false;
            for candidate in list {
                if sql_compare(&value, &eval(candidate, scope)?) == Some(Ordering::Equal) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Boolean(found != *negated))
        }
        Expr::Between { expr, negated, low, high } => {
            let value = eval(expr, scope)?;
            let low = eval(low, scope)?;
            let high = eval(high, scope)?;
            match (sql_compare(&value, &low), sql_compare(&value, &high)) {
                (Some(lo), Some(hi)) => {
                    let inside = lo != Ordering::Less && hi != Ordering::Greater;
                    Ok(Value::Boolean(inside != *negated))
                }
                _ => Ok(Value::Null),
            }
        }
        Expr::Like { negated, expr, pattern, .. } => like(eval(expr, scope)?, eval(pattern, scope)?, *negated, false),
        Expr::ILike { negated, expr, pattern, .. } => like(eval(expr, scope)?, eval(pattern, scope)?, *negated, true),
        Expr::Function(func) => {
            if func.over.is_some() {
                return Err(QueryError::UnsupportedSql("Window functions are not supported".to_string()).into());
            }
            let name = function_name(expr).unwrap_or_default();
            if AGGREGATES.contains(&name.as_str()) {
                let Scope::Group { table, rows } = scope else {
                    return Err(QueryError::UnsupportedSql(format!(
                        "Aggregate {} is not allowed here",
                        name.to_uppercase()
                    ))
                    .into());
                };
                return aggregate(&name, &func.args, func.distinct, table, rows);
            }
            let args = func
                .args
                .iter()
                .map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(inner)) => eval(inner, scope),
                    _ => Err(QueryError::UnsupportedSql(format!("Argument {} to {}", arg, name)).into()),
                })
                .collect::<TabulaResult<Vec<_>>>()?;
            scalar(&name, args)
        }
        other => Err(QueryError::UnsupportedSql(format!("Expression {}", other)).into()),
    }
}

/// Ordering between two non-null values, coercing text to numbers or timestamps when compared with them
fn sql_compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_) | Value::Text(_))
        | (Value::Text(_), Value::Integer(_) | Value::Float(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::Text(s)) => parse_datetime(s).map(|y| x.cmp(&y)),
        (Value::Text(s), Value::DateTime(y)) => parse_datetime(s).map(|x| x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn binary(lhs: &Value, op: &BinaryOperator, rhs: &Value) -> TabulaResult<Value> {
    let comparison = |test: fn(Ordering) -> bool| {
        Ok(sql_compare(lhs, rhs).map(|o| Value::Boolean(test(o))).unwrap_or(Value::Null))
    };
    match op {
        BinaryOperator::And => Ok(match (truth(lhs), truth(rhs)) {
            (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
            (Some(true), Some(true)) => Value::Boolean(true),
            _ => Value::Null,
        }),
        BinaryOperator::Or => Ok(match (truth(lhs), truth(rhs)) {
            (Some(true), _) | (_, Some(true)) => Value::Boolean(true),
            (Some(false), Some(false)) => Value::Boolean(false),
            _ => Value::Null,
        }),
        BinaryOperator::Eq => comparison(|o| o == Ordering::Equal),
        BinaryOperator::NotEq => comparison(|o| o != Ordering::Equal),
        BinaryOperator::Lt => comparison(|o| o == Ordering::Less),
        BinaryOperator::LtEq => comparison(|o| o != Ordering::Greater),
        BinaryOperator::Gt => comparison(|o| o == Ordering::Greater),
        BinaryOperator::GtEq => comparison(|o| o != Ordering::Less),
        BinaryOperator::StringConcat => Ok(if lhs.is_null() || rhs.is_null() {
            Value::Null
        } else {
            Value::Text(format!("{}{}", lhs.render(), rhs.render()))
        }),
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => Ok(arithmetic(lhs, op, rhs)),
        other => Err(QueryError::UnsupportedSql(format!("Operator {}", other)).into()),
    }
}

fn arithmetic(lhs: &Value, op: &BinaryOperator, rhs: &Value) -> Value {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        let result = match op {
            BinaryOperator::Plus => a.checked_add(*b),
            BinaryOperator::Minus => a.checked_sub(*b),
            BinaryOperator::Multiply => a.checked_mul(*b),
            BinaryOperator::Divide => a.checked_div(*b),
            _ => a.checked_rem(*b),
        };
        return result.map(Value::Integer).unwrap_or(Value::Null);
    }
    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Value::Null;
    };
    match op {
        BinaryOperator::Plus => Value::Float(a + b),
        BinaryOperator::Minus => Value::Float(a - b),
        BinaryOperator::Multiply => Value::Float(a * b),
        BinaryOperator::Divide if b == 0.0 => Value::Null,
        BinaryOperator::Divide => Value::Float(a / b),
        _ if b == 0.0 => Value::Null,
        _ => Value::Float(a % b),
    }
}

fn like(value: Value, pattern: Value, negated: bool, case_insensitive: bool) -> TabulaResult<Value> {
    if value.is_null() || pattern.is_null() {
        return Ok(Value::Null);
    }
    let mut regex = String::from("^");
    for ch in pattern.render().chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');

    let matcher = RegexBuilder::new(&regex)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| QueryError::InvalidSql(format!("Invalid LIKE pattern: {}", e)))?;
    Ok(Value::Boolean(matcher.is_match(&value.render()) != negated))
}

fn aggregate(name: &str, args: &[FunctionArg], distinct: bool, table: &Table, rows: &[usize]) -> TabulaResult<Value> {
    let argument = match args {
        [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if name == "count" => return Ok(Value::Integer(rows.len() as i64)),
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(inner))] => inner,
        _ => {
            return Err(QueryError::UnsupportedSql(format!("{} expects exactly one argument", name.to_uppercase())).into())
        }
    };

    let mut values = Vec::with_capacity(rows.len());
    for &row in rows {
        let value = eval(argument, Scope::Row { table, row })?;
        if !value.is_null() {
            values.push(value);
        }
    }
    if distinct {
        let mut seen = HashSet::new();
        values.retain(|v| seen.insert(ValueKey(v.clone())));
    }

    Ok(match name {
        "count" => Value::Integer(values.len() as i64),
        "sum" => {
            if values.is_empty() {
                Value::Null
            } else if values.iter().all(|v| matches!(v, Value::Integer(_))) {
                values
                    .iter()
                    .try_fold(0i64, |acc, v| match v {
                        Value::Integer(i) => acc.checked_add(*i),
                        _ => None,
                    })
                    .map(Value::Integer)
                    .unwrap_or_else(|| Value::Float(values.iter().filter_map(Value::as_f64).sum()))
            } else {
                Value::Float(values.iter().filter_map(Value::as_f64).sum())
            }
        }
        "avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        "min" => values.into_iter().min_by(|a, b| compare_values(a, b)).unwrap_or(Value::Null),
        _ => values.into_iter().max_by(|a, b| compare_values(a, b)).unwrap_or(Value::Null),
    })
}

fn scalar(name: &str, args: Vec<Value>) -> TabulaResult<Value> {
    let arity = |expected: usize| -> TabulaResult<()> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(QueryError::InvalidSql(format!(
                "{} expects {} argument(s), got {}",
                name.to_uppercase(),
                expected,
                args.len()
            ))
            .into())
        }
    };

    match name {
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "lower" | "upper" | "length" | "abs" => {
            arity(1)?;
            let value = &args[0];
            if value.is_null() {
                return Ok(Value::Null);
            }
            Ok(match name {
                "lower" => Value::Text(value.render().to_lowercase()),
                "upper" => Value::Text(value.render().to_uppercase()),
                "length" => Value::Integer(value.render().chars().count() as i64),
                _ => match value {
                    Value::Integer(i) => i.checked_abs().map(Value::Integer).unwrap_or(Value::Null),
                    other => other.as_f64().map(|f| Value::Float(f.abs())).unwrap_or(Value::Null),
                },
            })
        }
        "round" => {
            let places = match args.len() {
                1 => 0,
                2 => args[1].as_f64().map(|p| p as i32).unwrap_or(0),
                _ => return arity(2).map(|_| Value::Null),
            };
            Ok(match &args[0] {
                Value::Integer(i) if places >= 0 => Value::Integer(*i),
                other => other
                    .as_f64()
                    .map(|f| {
                        let factor = 10f64.powi(places);
                        Value::Float((f * factor).round() / factor)
                    })
                    .unwrap_or(Value::Null),
            })
        }
        other => Err(QueryError::UnsupportedSql(format!("Function {}", other.to_uppercase())).into()),
    }
}
