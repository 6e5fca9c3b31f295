//! Row documents: conditions, queries and mutations
//!
//! Each request type decodes from its JSON document, renders to SQL with
//! bound parameters for relational stores, and (for conditions and queries)
//! evaluates directly against JSON rows for stores without SQL.

use std::cmp::Ordering;

use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};

use crate::codec::to_sql_value;
use crate::models::{quote_ident, validate_identifier};
use crate::storage::{StorageError, StorageResult};

/// Comparison applied by a single condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    Like,
    IsNull,
    NotNull,
}

impl Comparison {
    fn parse(text: &str) -> StorageResult<Self> {
        let op = match text.trim().to_ascii_lowercase().as_str() {
            "=" => Comparison::Eq,
            "!=" | "<>" => Comparison::Ne,
            "<" => Comparison::Lt,
            ">" => Comparison::Gt,
            "<=" => Comparison::Le,
            ">=" => Comparison::Ge,
            "in" => Comparison::In,
            "not in" => Comparison::NotIn,
            "like" => Comparison::Like,
            "isnull" => Comparison::IsNull,
            "notnull" => Comparison::NotNull,
            other => {
                return Err(StorageError::invalid(format!(
                    "unknown condition '{}'",
                    other
                )))
            }
        };
        Ok(op)
    }

    fn sql(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Lt => "<",
            Comparison::Gt => ">",
            Comparison::Le => "<=",
            Comparison::Ge => ">=",
            Comparison::In => "IN",
            Comparison::NotIn => "NOT IN",
            Comparison::Like => "LIKE",
            Comparison::IsNull => "IS NULL",
            Comparison::NotNull => "IS NOT NULL",
        }
    }
}

/// A `where` clause: one comparison chained with `and` / `or`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub comparison: Comparison,
    pub value: Value,
    pub and: Option<Box<Condition>>,
    pub or: Option<Box<Condition>>,
}

impl Condition {
    pub fn decode(doc: &Value) -> StorageResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::invalid("'where' must be an object"))?;

        let column = required_str(obj, "column")?;
        validate_identifier(column)?;
        let comparison = Comparison::parse(required_str(obj, "condition")?)?;

        let value = obj.get("value").cloned().unwrap_or(Value::Null);
        match comparison {
            Comparison::In | Comparison::NotIn if !value.is_array() => {
                return Err(StorageError::invalid(format!(
                    "condition on '{}' needs an array value",
                    column
                )))
            }
            Comparison::IsNull | Comparison::NotNull => {}
            _ if !obj.contains_key("value") => {
                return Err(StorageError::invalid(format!(
                    "condition on '{}' is missing 'value'",
                    column
                )))
            }
            _ => {}
        }

        let and = obj.get("and").map(Condition::decode).transpose()?.map(Box::new);
        let or = obj.get("or").map(Condition::decode).transpose()?.map(Box::new);

        Ok(Self {
            column: column.to_string(),
            comparison,
            value,
            and,
            or,
        })
    }

    /// Render as SQL, pushing bound values onto `params`
    pub fn to_sql(&self, params: &mut Vec<SqlValue>) -> String {
        let column = quote_ident(&self.column);
        let mut sql = match self.comparison {
            Comparison::IsNull | Comparison::NotNull => {
                format!("{} {}", column, self.comparison.sql())
            }
            Comparison::In | Comparison::NotIn => {
                let items = self.value.as_array().map(Vec::as_slice).unwrap_or(&[]);
                if items.is_empty() {
                    // IN () matches nothing, NOT IN () matches everything
                    let always = if self.comparison == Comparison::In { "0" } else { "1" };
                    always.to_string()
                } else {
                    let placeholders: Vec<&str> = items
                        .iter()
                        .map(|item| {
                            params.push(to_sql_value(item));
                            "?"
                        })
                        .collect();
                    format!(
                        "{} {} ({})",
                        column,
                        self.comparison.sql(),
                        placeholders.join(", ")
                    )
                }
            }
            _ => {
                params.push(to_sql_value(&self.value));
                format!("{} {} ?", column, self.comparison.sql())
            }
        };

        if let Some(and) = &self.and {
            sql = format!("({} AND {})", sql, and.to_sql(params));
        }
        if let Some(or) = &self.or {
            sql = format!("({} OR {})", sql, or.to_sql(params));
        }
        sql
    }

    /// Evaluate against a JSON row; missing columns read as null
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(&self.column).unwrap_or(&Value::Null);
        let mut result = match self.comparison {
            Comparison::IsNull => field.is_null(),
            Comparison::NotNull => !field.is_null(),
            Comparison::In => contains(&self.value, field),
            Comparison::NotIn => !field.is_null() && !contains(&self.value, field),
            Comparison::Like => match (field.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => like(text, pattern),
                _ => false,
            },
            op => match compare_values(field, &self.value) {
                Some(ordering) => match op {
                    Comparison::Eq => ordering == Ordering::Equal,
                    Comparison::Ne => ordering != Ordering::Equal,
                    Comparison::Lt => ordering == Ordering::Less,
                    Comparison::Gt => ordering == Ordering::Greater,
                    Comparison::Le => ordering != Ordering::Greater,
                    Comparison::Ge => ordering != Ordering::Less,
                    _ => false,
                },
                None => false,
            },
        };

        if let Some(and) = &self.and {
            result = result && and.matches(row);
        }
        if let Some(or) = &self.or {
            result = result || or.matches(row);
        }
        result
    }
}

fn contains(list: &Value, field: &Value) -> bool {
    list.as_array()
        .map(|items| {
            items
                .iter()
                .any(|item| compare_values(field, item) == Some(Ordering::Equal))
        })
        .unwrap_or(false)
}

/// Order two scalar values the way SQL would; mismatched types don't compare
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Number(y)) => f64::from(u8::from(*x)).partial_cmp(&y.as_f64()?),
        (Value::Number(x), Value::Bool(y)) => x.as_f64()?.partial_cmp(&f64::from(u8::from(*y))),
        _ => None,
    }
}

/// SQL LIKE: `%` any run, `_` any single character, ASCII case-insensitive
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    // Last `%` seen and the text position it is currently matched up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(&'%') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '_' || c.eq_ignore_ascii_case(&text[t]) => {
                t += 1;
                p += 1;
            }
            _ => match star {
                // Let the last `%` absorb one more character and retry
                Some((star_p, star_t)) => {
                    star = Some((star_p, star_t + 1));
                    p = star_p + 1;
                    t = star_t + 1;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

/// One `sort` entry
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    fn decode(doc: &Value) -> StorageResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::invalid("sort entries must be objects"))?;
        let column = required_str(obj, "column")?;
        validate_identifier(column)?;
        let descending = match obj.get("direction").and_then(Value::as_str) {
            None => false,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => false,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => true,
            Some(dir) => {
                return Err(StorageError::invalid(format!(
                    "unknown sort direction '{}'",
                    dir
                )))
            }
        };
        Ok(Self {
            column: column.to_string(),
            descending,
        })
    }
}

/// One `return` entry: a column, optionally renamed
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnColumn {
    pub column: String,
    pub alias: Option<String>,
}

impl ReturnColumn {
    fn decode(doc: &Value) -> StorageResult<Self> {
        let (column, alias) = match doc {
            Value::String(column) => (column.as_str(), None),
            Value::Object(obj) => {
                let alias = obj.get("alias").and_then(Value::as_str);
                (required_str(obj, "column")?, alias)
            }
            _ => return Err(StorageError::invalid("'return' entries must be names or objects")),
        };
        validate_identifier(column)?;
        if let Some(alias) = alias {
            validate_identifier(alias)?;
        }
        Ok(Self {
            column: column.to_string(),
            alias: alias.map(str::to_string),
        })
    }

    /// Name the column carries in the result row
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.column)
    }
}

/// A retrieve query: filter, projection, ordering and paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub condition: Option<Condition>,
    pub columns: Vec<ReturnColumn>,
    pub sort: Vec<SortKey>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

impl Query {
    pub fn decode(doc: &Value) -> StorageResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::invalid("query must be an object"))?;

        let condition = obj.get("where").map(Condition::decode).transpose()?;

        let columns = match obj.get("return") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(ReturnColumn::decode)
                .collect::<StorageResult<_>>()?,
            Some(_) => return Err(StorageError::invalid("'return' must be an array")),
        };

        let sort = match obj.get("sort") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(SortKey::decode)
                .collect::<StorageResult<_>>()?,
            Some(single) => vec![SortKey::decode(single)?],
        };

        Ok(Self {
            condition,
            columns,
            sort,
            limit: optional_u64(obj, "limit")?,
            skip: optional_u64(obj, "skip")?,
        })
    }

    /// Build a `SELECT` over `from` (already quoted)
    pub fn to_sql(&self, from: &str, params: &mut Vec<SqlValue>) -> String {
        let projection = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| match &c.alias {
                    Some(alias) => format!("{} AS {}", quote_ident(&c.column), quote_ident(alias)),
                    None => quote_ident(&c.column),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", projection, from);
        if let Some(condition) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition.to_sql(params));
        }
        if !self.sort.is_empty() {
            let keys: Vec<String> = self
                .sort
                .iter()
                .map(|k| {
                    format!(
                        "{} {}",
                        quote_ident(&k.column),
                        if k.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        match (self.limit, self.skip) {
            (Some(limit), skip) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, skip.unwrap_or(0)))
            }
            (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", skip)),
            (None, None) => {}
        }
        sql
    }

    /// Apply the query to rows held in memory
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.condition.as_ref().map_or(true, |c| c.matches(row)))
            .collect();

        if !self.sort.is_empty() {
            rows.sort_by(|a, b| {
                for key in &self.sort {
                    let left = a.get(&key.column).unwrap_or(&Value::Null);
                    let right = b.get(&key.column).unwrap_or(&Value::Null);
                    let ordering = sort_order(left, right);
                    let ordering = if key.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0) as usize;
        let limit = self.limit.map_or(usize::MAX, |l| l as usize);
        rows.into_iter()
            .skip(skip)
            .take(limit)
            .map(|row| self.project(row))
            .collect()
    }

    fn project(&self, row: Value) -> Value {
        if self.columns.is_empty() {
            return row;
        }
        let mut out = Map::new();
        for column in &self.columns {
            let value = row.get(&column.column).cloned().unwrap_or(Value::Null);
            out.insert(column.output_name().to_string(), value);
        }
        Value::Object(out)
    }
}

/// Nulls sort first, as in SQLite
fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Rows to insert in one call
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRequest {
    pub rows: Vec<Map<String, Value>>,
}

impl InsertRequest {
    pub fn decode(doc: &Value) -> StorageResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::invalid("insert payload must be an object"))?;

        let rows = match obj.get("inserts") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_object()
                        .cloned()
                        .ok_or_else(|| StorageError::invalid("each insert must be an object"))
                })
                .collect::<StorageResult<Vec<_>>>()?,
            Some(_) => return Err(StorageError::invalid("'inserts' must be an array")),
            None => vec![obj.clone()],
        };

        for row in &rows {
            if row.is_empty() {
                return Err(StorageError::invalid("insert row has no columns"));
            }
            for column in row.keys() {
                validate_identifier(column)?;
            }
        }
        Ok(Self { rows })
    }

    /// One `INSERT` statement per row
    pub fn to_sql(&self, table: &str) -> Vec<(String, Vec<SqlValue>)> {
        self.rows
            .iter()
            .map(|row| {
                let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
                let placeholders = vec!["?"; row.len()].join(", ");
                let params = row.values().map(to_sql_value).collect();
                (
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table,
                        columns.join(", "),
                        placeholders
                    ),
                    params,
                )
            })
            .collect()
    }
}

/// Arithmetic applied to a column by an update expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub column: String,
    pub operator: char,
    pub value: Value,
}

/// One update: new values and expressions under an optional condition
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub values: Map<String, Value>,
    pub expressions: Vec<Expression>,
    pub condition: Option<Condition>,
}

impl Update {
    fn decode(doc: &Value) -> StorageResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::invalid("update must be an object"))?;

        let values = match obj.get("values") {
            None => Map::new(),
            Some(Value::Object(values)) => values.clone(),
            Some(_) => return Err(StorageError::invalid("'values' must be an object")),
        };
        for column in values.keys() {
            validate_identifier(column)?;
        }

        let expressions = match obj.get("expressions") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(decode_expression)
                .collect::<StorageResult<_>>()?,
            Some(_) => return Err(StorageError::invalid("'expressions' must be an array")),
        };

        if values.is_empty() && expressions.is_empty() {
            return Err(StorageError::invalid(
                "update needs 'values' or 'expressions'",
            ));
        }

        let condition = obj.get("where").map(Condition::decode).transpose()?;
        Ok(Self {
            values,
            expressions,
            condition,
        })
    }

    pub fn to_sql(&self, table: &str) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut assignments: Vec<String> = self
            .values
            .iter()
            .map(|(column, value)| {
                params.push(to_sql_value(value));
                format!("{} = ?", quote_ident(column))
            })
            .collect();
        for expr in &self.expressions {
            params.push(to_sql_value(&expr.value));
            let column = quote_ident(&expr.column);
            assignments.push(format!("{} = {} {} ?", column, column, expr.operator));
        }

        let mut sql = format!("UPDATE {} SET {}", table, assignments.join(", "));
        if let Some(condition) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition.to_sql(&mut params));
        }
        (sql, params)
    }
}

fn decode_expression(doc: &Value) -> StorageResult<Expression> {
    let obj = doc
        .as_object()
        .ok_or_else(|| StorageError::invalid("expressions must be objects"))?;
    let column = required_str(obj, "column")?;
    validate_identifier(column)?;
    let operator = match required_str(obj, "operator")? {
        "+" => '+',
        "-" => '-',
        "*" => '*',
        "/" => '/',
        other => {
            return Err(StorageError::invalid(format!(
                "unknown operator '{}'",
                other
            )))
        }
    };
    let value = obj
        .get("value")
        .filter(|v| v.is_number())
        .cloned()
        .ok_or_else(|| StorageError::invalid("expression value must be a number"))?;
    Ok(Expression {
        column: column.to_string(),
        operator,
        value,
    })
}

/// Updates to run in one call
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub updates: Vec<Update>,
}

impl UpdateRequest {
    pub fn decode(doc: &Value) -> StorageResult<Self> {
        let updates = match doc.get("updates") {
            Some(Value::Array(items)) => items
                .iter()
                .map(Update::decode)
                .collect::<StorageResult<Vec<_>>>()?,
            Some(_) => return Err(StorageError::invalid("'updates' must be an array")),
            None => vec![Update::decode(doc)?],
        };
        if updates.is_empty() {
            return Err(StorageError::invalid("no updates given"));
        }
        Ok(Self { updates })
    }
}

/// Rows to delete; no condition deletes every row
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub condition: Option<Condition>,
}

impl DeleteRequest {
    pub fn decode(doc: &Value) -> StorageResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| StorageError::invalid("delete condition must be an object"))?;
        let condition = obj.get("where").map(Condition::decode).transpose()?;
        Ok(Self { condition })
    }

    pub fn to_sql(&self, table: &str) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", table);
        if let Some(condition) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition.to_sql(&mut params));
        }
        (sql, params)
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, key: &str) -> StorageResult<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::invalid(format!("missing '{}'", key)))
}

fn optional_u64(obj: &Map<String, Value>, key: &str) -> StorageResult<Option<u64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| StorageError::invalid(format!("'{}' must be a non-negative integer", key))),
    }
}
