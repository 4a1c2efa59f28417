//! Portable SQL construction
//!
//! Statements are written once with `?` placeholders and translated to the
//! target dialect when built, so drivers never special-case placeholder
//! syntax or upsert clauses.

use std::fmt::Write as _;

/// SQL flavour a statement is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

/// A bind parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn keyword(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Select,
    Insert,
    Update,
    Delete,
}

/// Rendered statement and its arguments, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: Dialect,
    kind: Kind,
    table: String,
    columns: Vec<String>,
    sets: Vec<String>,
    conditions: Vec<String>,
    order: Vec<(String, Order)>,
    limit: Option<u64>,
    offset: Option<u64>,
    conflict: Option<(Vec<String>, Vec<String>)>,
    args: Vec<SqlValue>,
    set_args: Vec<SqlValue>,
}

impl QueryBuilder {
    fn new(dialect: Dialect, kind: Kind, table: &str) -> Self {
        Self {
            dialect,
            kind,
            table: table.to_string(),
            columns: Vec::new(),
            sets: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            conflict: None,
            args: Vec::new(),
            set_args: Vec::new(),
        }
    }

    pub fn select(dialect: Dialect, table: &str, columns: &[&str]) -> Self {
        let mut builder = Self::new(dialect, Kind::Select, table);
        builder.columns = columns.iter().map(|c| c.to_string()).collect();
        builder
    }

    /// `INSERT` with one placeholder per column; values are bound by the caller
    pub fn insert(dialect: Dialect, table: &str, columns: &[&str]) -> Self {
        let mut builder = Self::new(dialect, Kind::Insert, table);
        builder.columns = columns.iter().map(|c| c.to_string()).collect();
        builder
    }

    pub fn update(dialect: Dialect, table: &str) -> Self {
        Self::new(dialect, Kind::Update, table)
    }

    pub fn delete(dialect: Dialect, table: &str) -> Self {
        Self::new(dialect, Kind::Delete, table)
    }

    /// `SET column = ?`
    pub fn set(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.sets.push(format!("{column} = ?"));
        self.set_args.push(value.into());
        self
    }

    /// `SET column = <expr>` where `expr` may contain placeholders
    pub fn set_expr(mut self, column: &str, expr: &str, args: Vec<SqlValue>) -> Self {
        self.sets.push(format!("{column} = {expr}"));
        self.set_args.extend(args);
        self
    }

    /// Turn an insert into an upsert on `conflict` updating `update` columns
    pub fn on_conflict_update(mut self, conflict: &[&str], update: &[&str]) -> Self {
        self.conflict = Some((
            conflict.iter().map(|c| c.to_string()).collect(),
            update.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn where_eq(self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.where_op(column, "=", value)
    }

    pub fn where_op(mut self, column: &str, op: &str, value: impl Into<SqlValue>) -> Self {
        self.conditions.push(format!("{column} {op} ?"));
        self.args.push(value.into());
        self
    }

    /// `column IN (?, ...)`; an empty list matches nothing
    pub fn where_in<V: Into<SqlValue>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<SqlValue> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.conditions.push("1 = 0".to_string());
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.conditions.push(format!("{column} IN ({placeholders})"));
        self.args.extend(values);
        self
    }

    pub fn where_raw(mut self, condition: &str, args: Vec<SqlValue>) -> Self {
        self.conditions.push(format!("({condition})"));
        self.args.extend(args);
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order.push((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn build(self) -> BuiltQuery {
        let mut sql = String::new();
        let mut args = Vec::new();

        match self.kind {
            Kind::Select => {
                let columns = if self.columns.is_empty() {
                    "*".to_string()
                } else {
                    self.columns.join(", ")
                };
                let _ = write!(sql, "SELECT {columns} FROM {}", self.table);
            }
            Kind::Insert => {
                let placeholders = vec!["?"; self.columns.len()].join(", ");
                let _ = write!(
                    sql,
                    "INSERT INTO {} ({}) VALUES ({placeholders})",
                    self.table,
                    self.columns.join(", ")
                );
                if let Some((conflict, update)) = &self.conflict {
                    sql.push_str(&upsert_clause(self.dialect, conflict, update));
                }
            }
            Kind::Update => {
                let _ = write!(sql, "UPDATE {} SET {}", self.table, self.sets.join(", "));
                args.extend(self.set_args);
            }
            Kind::Delete => {
                let _ = write!(sql, "DELETE FROM {}", self.table);
            }
        }

        if !self.conditions.is_empty() {
            let _ = write!(sql, " WHERE {}", self.conditions.join(" AND "));
        }
        args.extend(self.args);

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(column, order)| format!("{column} {}", order.keyword()))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(sql, " ORDER BY {order}");
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                let _ = write!(sql, " LIMIT ? OFFSET ?");
                args.push(SqlValue::Int(limit as i64));
                args.push(SqlValue::Int(offset as i64));
            }
            (Some(limit), None) => {
                let _ = write!(sql, " LIMIT ?");
                args.push(SqlValue::Int(limit as i64));
            }
            (None, Some(offset)) => {
                // SQLite and MySQL require a LIMIT before OFFSET
                let _ = write!(sql, " LIMIT ? OFFSET ?");
                args.push(SqlValue::Int(i64::MAX));
                args.push(SqlValue::Int(offset as i64));
            }
            (None, None) => {}
        }

        BuiltQuery {
            sql: rewrite_placeholders(&sql, self.dialect),
            args,
        }
    }
}

fn upsert_clause(dialect: Dialect, conflict: &[String], update: &[String]) -> String {
    match dialect {
        Dialect::Sqlite | Dialect::Postgres => {
            let sets = update
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(" ON CONFLICT ({}) DO UPDATE SET {sets}", conflict.join(", "))
        }
        Dialect::MySql => {
            let sets = update
                .iter()
                .map(|c| format!("{c} = VALUES({c})"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(" ON DUPLICATE KEY UPDATE {sets}")
        }
    }
}

/// Rewrite `?` placeholders for the target dialect.
///
/// PostgreSQL gets `$1, $2, ...`. Question marks inside single- or
/// double-quoted text are left alone.
pub fn rewrite_placeholders(sql: &str, dialect: Dialect) -> String {
    if dialect != Dialect::Postgres {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    let mut quote: Option<char> = None;

    for ch in sql.chars() {
        match quote {
            Some(q) => {
                // A doubled quote closes and reopens, which keeps us in the same state.
                if ch == q {
                    quote = None;
                }
                out.push(ch);
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '?' => {
                    index += 1;
                    let _ = write!(out, "${index}");
                }
                _ => out.push(ch),
            },
        }
    }
    out
}
