//! Generic record handle: one typed accessor per declared record, queried by
//! name at runtime. Values travel as JSON maps; the declaration's column
//! types drive SQL binding and row decoding.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::schema::{ColumnType, RecordDecl};
use crate::util::now_rfc3339;

/// One row of a declared record type.
#[derive(Clone, Debug)]
pub struct Record {
    pub id: i64,
    values: Map<String, Value>,
    readonly: bool,
}

impl Record {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn str(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(Value::as_str)
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        self.values.get(column).and_then(Value::as_i64)
    }

    pub fn boolean(&self, column: &str) -> Option<bool> {
        self.values.get(column).and_then(Value::as_bool)
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// All column values, id included. This is what prompt interpolation sees
    /// when a declaration has no `prompt_attrs` hook.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attrs = self.values.clone();
        attrs.insert("id".into(), Value::from(self.id));
        attrs
    }
}

/// Sort order for `filter`.
#[derive(Clone, Debug)]
pub enum Order {
    Asc(String),
    Desc(String),
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self::Asc(column.to_owned())
    }

    pub fn desc(column: &str) -> Self {
        Self::Desc(column.to_owned())
    }

    fn sql(&self) -> String {
        match self {
            Self::Asc(col) => format!("{col} ASC"),
            Self::Desc(col) => format!("{col} DESC"),
        }
    }
}

/// Query handle for one record type. All operations take `&Connection` so
/// mutations compose inside a store transaction; the readonly flag is
/// injected by version-pinned stores.
#[derive(Clone)]
#[derive(Debug)]
pub struct RecordHandle {
    decl: Arc<RecordDecl>,
    readonly: bool,
}

impl RecordHandle {
    pub fn new(decl: Arc<RecordDecl>, readonly: bool) -> Self {
        Self { decl, readonly }
    }

    pub fn decl(&self) -> &RecordDecl {
        &self.decl
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    fn ensure_writable(&self, op: &str) -> Result<(), StoreError> {
        if self.readonly {
            return Err(StoreError::ReadOnly(format!(
                "{} on {} (version store)",
                op, self.decl.name
            )));
        }
        Ok(())
    }

    fn select_list(&self) -> String {
        let mut cols = vec!["id".to_string()];
        cols.extend(self.decl.columns.iter().map(|c| c.name.clone()));
        cols.join(", ")
    }

    fn bind(&self, column: &str, value: &Value) -> Result<SqlValue, StoreError> {
        let def = self.decl.column_def(column).ok_or_else(|| {
            StoreError::UnknownRecord(format!("column {column} on {}", self.decl.name))
        })?;
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        let bound = match def.ty {
            ColumnType::Text => SqlValue::Text(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            ColumnType::Integer => SqlValue::Integer(value.as_i64().ok_or_else(|| {
                StoreError::Serialization(serde::de::Error::custom(format!(
                    "expected integer for {}.{column}, got {value}",
                    self.decl.table
                )))
            })?),
            ColumnType::Real => SqlValue::Real(value.as_f64().ok_or_else(|| {
                StoreError::Serialization(serde::de::Error::custom(format!(
                    "expected number for {}.{column}, got {value}",
                    self.decl.table
                )))
            })?),
            ColumnType::Boolean => match value.as_bool() {
                Some(b) => SqlValue::Integer(i64::from(b)),
                None => {
                    return Err(StoreError::Serialization(serde::de::Error::custom(
                        format!("expected boolean for {}.{column}, got {value}", self.decl.table),
                    )))
                }
            },
            ColumnType::Json => SqlValue::Text(serde_json::to_string(value)?),
        };
        Ok(bound)
    }

    fn decode_row(&self, row: &rusqlite::Row<'_>) -> Result<Record, rusqlite::Error> {
        let id: i64 = row.get(0)?;
        let mut values = Map::new();
        for (i, def) in self.decl.columns.iter().enumerate() {
            let idx = i + 1;
            let value = match def.ty {
                ColumnType::Text => row
                    .get::<_, Option<String>>(idx)?
                    .map_or(Value::Null, Value::String),
                ColumnType::Integer => row
                    .get::<_, Option<i64>>(idx)?
                    .map_or(Value::Null, Value::from),
                ColumnType::Real => row
                    .get::<_, Option<f64>>(idx)?
                    .map_or(Value::Null, Value::from),
                ColumnType::Boolean => row
                    .get::<_, Option<i64>>(idx)?
                    .map_or(Value::Null, |v| Value::from(v != 0)),
                ColumnType::Json => match row.get::<_, Option<String>>(idx)? {
                    Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            idx,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    None => Value::Null,
                },
            };
            values.insert(def.name.clone(), value);
        }
        Ok(Record {
            id,
            values,
            readonly: self.readonly,
        })
    }

    fn stamp_timestamps(&self, values: &mut Map<String, Value>, creating: bool) {
        let now = now_rfc3339();
        if creating
            && self.decl.column_def("created_at").is_some()
            && !values.contains_key("created_at")
        {
            values.insert("created_at".into(), Value::String(now.clone()));
        }
        if self.decl.column_def("updated_at").is_some() && !values.contains_key("updated_at") {
            values.insert("updated_at".into(), Value::String(now));
        }
    }

    pub fn create(&self, conn: &Connection, values: Map<String, Value>) -> Result<Record, StoreError> {
        self.ensure_writable("create")?;
        let mut values = values;
        self.stamp_timestamps(&mut values, true);

        if values.is_empty() {
            conn.execute(
                &format!("INSERT INTO {} DEFAULT VALUES", self.decl.table),
                [],
            )?;
            return self.find(conn, conn.last_insert_rowid());
        }

        let columns: Vec<&String> = values.keys().collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.decl.table,
            columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );

        let mut params: Vec<SqlValue> = Vec::with_capacity(values.len());
        for (column, value) in &values {
            params.push(self.bind(column, value)?);
        }
        conn.execute(&sql, rusqlite::params_from_iter(params))?;
        let id = conn.last_insert_rowid();
        self.find(conn, id)
    }

    pub fn find(&self, conn: &Connection, id: i64) -> Result<Record, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            self.select_list(),
            self.decl.table
        );
        conn.query_row(&sql, [id], |row| self.decode_row(row))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("{} {id}", self.decl.name))
                }
                other => StoreError::Database(other),
            })
    }

    pub fn find_by(
        &self,
        conn: &Connection,
        conditions: &[(&str, Value)],
    ) -> Result<Option<Record>, StoreError> {
        let mut rows = self.filter(conn, conditions, Order::asc("id"), Some(1))?;
        Ok(rows.pop())
    }

    pub fn find_or_create_by(
        &self,
        conn: &Connection,
        values: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        let conditions: Vec<(&str, Value)> = values
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        if let Some(existing) = self.find_by(conn, &conditions)? {
            return Ok(existing);
        }
        self.create(conn, values)
    }

    pub fn update(
        &self,
        conn: &Connection,
        id: i64,
        values: Map<String, Value>,
    ) -> Result<Record, StoreError> {
        self.ensure_writable("update")?;
        let mut values = values;
        self.stamp_timestamps(&mut values, false);

        let assignments: Vec<String> = values
            .keys()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            self.decl.table,
            assignments.join(", "),
            values.len() + 1
        );

        let mut params: Vec<SqlValue> = Vec::with_capacity(values.len() + 1);
        for (column, value) in &values {
            params.push(self.bind(column, value)?);
        }
        params.push(SqlValue::Integer(id));
        let changed = conn.execute(&sql, rusqlite::params_from_iter(params))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("{} {id}", self.decl.name)));
        }
        self.find(conn, id)
    }

    pub fn filter(
        &self,
        conn: &Connection,
        conditions: &[(&str, Value)],
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let mut sql = format!("SELECT {} FROM {}", self.select_list(), self.decl.table);
        let mut params: Vec<SqlValue> = Vec::new();

        if !conditions.is_empty() {
            let mut clauses = Vec::with_capacity(conditions.len());
            for (column, value) in conditions {
                if value.is_null() {
                    clauses.push(format!("{column} IS NULL"));
                } else {
                    params.push(self.bind(column, value)?);
                    clauses.push(format!("{column} = ?{}", params.len()));
                }
            }
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        sql.push_str(&format!(" ORDER BY {}", order.sql()));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                self.decode_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all(&self, conn: &Connection) -> Result<Vec<Record>, StoreError> {
        self.filter(conn, &[], Order::asc("id"), None)
    }

    pub fn first(&self, conn: &Connection) -> Result<Option<Record>, StoreError> {
        let mut rows = self.filter(conn, &[], Order::asc("id"), Some(1))?;
        Ok(rows.pop())
    }

    pub fn count(&self, conn: &Connection) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.decl.table);
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn delete_all(&self, conn: &Connection) -> Result<usize, StoreError> {
        self.ensure_writable("delete_all")?;
        let sql = format!("DELETE FROM {}", self.decl.table);
        Ok(conn.execute(&sql, [])?)
    }

    /// Attributes interpolated into this record's prompts: the declaration's
    /// `prompt_attrs` hook when present, every column value otherwise.
    pub fn prompt_attrs(&self, record: &Record) -> Map<String, Value> {
        match &self.decl.prompt_attrs {
            Some(f) => f(record),
            None => record.attributes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, RecordDecl};
    use serde_json::json;

    fn handle(readonly: bool) -> (Connection, RecordHandle) {
        let conn = Connection::open_in_memory().unwrap();
        let decl = RecordDecl::new("post")
            .text("title")
            .integer("views")
            .boolean("published")
            .json("tags")
            .column(ColumnDef::new("note", ColumnType::Text))
            .timestamps();
        conn.execute_batch(&decl.ddl()).unwrap();
        (conn, RecordHandle::new(Arc::new(decl), readonly))
    }

    fn values(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn create_and_find() {
        let (conn, posts) = handle(false);
        let record = posts
            .create(
                &conn,
                values(&[
                    ("title", json!("hello")),
                    ("views", json!(3)),
                    ("published", json!(true)),
                    ("tags", json!(["a", "b"])),
                ]),
            )
            .unwrap();

        let found = posts.find(&conn, record.id).unwrap();
        assert_eq!(found.str("title"), Some("hello"));
        assert_eq!(found.integer("views"), Some(3));
        assert_eq!(found.boolean("published"), Some(true));
        assert_eq!(found.get("tags"), Some(&json!(["a", "b"])));
        assert!(found.str("created_at").is_some());
    }

    #[test]
    fn find_missing_is_not_found() {
        let (conn, posts) = handle(false);
        let err = posts.find(&conn, 99).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn update_changes_values_and_updated_at() {
        let (conn, posts) = handle(false);
        let record = posts
            .create(&conn, values(&[("title", json!("v1"))]))
            .unwrap();
        let before = record.str("updated_at").unwrap().to_owned();

        let updated = posts
            .update(&conn, record.id, values(&[("title", json!("v2"))]))
            .unwrap();
        assert_eq!(updated.str("title"), Some("v2"));
        assert!(updated.str("updated_at").unwrap() >= before.as_str());
    }

    #[test]
    fn update_missing_is_not_found() {
        let (conn, posts) = handle(false);
        let err = posts
            .update(&conn, 99, values(&[("title", json!("x"))]))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn find_or_create_by_is_idempotent() {
        let (conn, posts) = handle(false);
        let a = posts
            .find_or_create_by(&conn, values(&[("title", json!("same"))]))
            .unwrap();
        let b = posts
            .find_or_create_by(&conn, values(&[("title", json!("same"))]))
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(posts.count(&conn).unwrap(), 1);
    }

    #[test]
    fn filter_with_conditions_and_order() {
        let (conn, posts) = handle(false);
        for (title, views) in [("a", 1), ("b", 5), ("c", 3)] {
            posts
                .create(
                    &conn,
                    values(&[("title", json!(title)), ("views", json!(views)), ("published", json!(true))]),
                )
                .unwrap();
        }
        posts
            .create(
                &conn,
                values(&[("title", json!("d")), ("published", json!(false))]),
            )
            .unwrap();

        let published = posts
            .filter(
                &conn,
                &[("published", json!(true))],
                Order::desc("views"),
                None,
            )
            .unwrap();
        let titles: Vec<&str> = published.iter().filter_map(|r| r.str("title")).collect();
        assert_eq!(titles, vec!["b", "c", "a"]);
    }

    #[test]
    fn filter_null_condition_uses_is_null() {
        let (conn, posts) = handle(false);
        posts
            .create(&conn, values(&[("title", json!("has-note")), ("note", json!("n"))]))
            .unwrap();
        posts
            .create(&conn, values(&[("title", json!("no-note"))]))
            .unwrap();

        let unnoted = posts
            .filter(&conn, &[("note", Value::Null)], Order::asc("id"), None)
            .unwrap();
        assert_eq!(unnoted.len(), 1);
        assert_eq!(unnoted[0].str("title"), Some("no-note"));
    }

    #[test]
    fn first_count_all_delete_all() {
        let (conn, posts) = handle(false);
        assert!(posts.first(&conn).unwrap().is_none());

        posts.create(&conn, values(&[("title", json!("one"))])).unwrap();
        posts.create(&conn, values(&[("title", json!("two"))])).unwrap();

        assert_eq!(posts.count(&conn).unwrap(), 2);
        assert_eq!(posts.all(&conn).unwrap().len(), 2);
        assert_eq!(posts.first(&conn).unwrap().unwrap().str("title"), Some("one"));

        posts.delete_all(&conn).unwrap();
        assert_eq!(posts.count(&conn).unwrap(), 0);
    }

    #[test]
    fn readonly_handle_rejects_writes() {
        let (conn, posts) = handle(true);
        let err = posts
            .create(&conn, values(&[("title", json!("x"))]))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly(_)));

        let err = posts.update(&conn, 1, values(&[("title", json!("x"))])).unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly(_)));

        let err = posts.delete_all(&conn).unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly(_)));
    }

    #[test]
    fn readonly_flag_reaches_records() {
        let (conn, writable) = handle(false);
        writable
            .create(&conn, values(&[("title", json!("x"))]))
            .unwrap();
        let pinned = RecordHandle::new(Arc::clone(&writable.decl), true);
        let record = pinned.find(&conn, 1).unwrap();
        assert!(record.readonly());
    }

    #[test]
    fn bind_rejects_type_mismatch() {
        let (conn, posts) = handle(false);
        let err = posts
            .create(&conn, values(&[("views", json!("not a number"))]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn prompt_attrs_defaults_to_attributes() {
        let (conn, posts) = handle(false);
        let record = posts
            .create(&conn, values(&[("title", json!("t"))]))
            .unwrap();
        let attrs = posts.prompt_attrs(&record);
        assert_eq!(attrs["title"], json!("t"));
        assert_eq!(attrs["id"], json!(record.id));
    }
}
