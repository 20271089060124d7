//! Typed record declarations and the DDL derived from them. Declarations for
//! the same record name are additive: columns union by name (later
//! declaration wins), behavior hooks concatenate.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Closed set of column types; anything else is unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Json,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Boolean => "INTEGER",
            Self::Json => "JSON",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub not_null: bool,
    pub unique: bool,
    pub default_sql: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            not_null: false,
            unique: false,
            default_sql: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_sql(mut self, sql: impl Into<String>) -> Self {
        self.default_sql = Some(sql.into());
        self
    }

    fn ddl(&self) -> String {
        let mut out = format!("{} {}", self.name, self.ty.sql_type());
        if self.not_null {
            out.push_str(" NOT NULL");
        }
        if self.unique {
            out.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default_sql {
            out.push_str(" DEFAULT ");
            out.push_str(default);
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryKey {
    /// `id INTEGER PRIMARY KEY AUTOINCREMENT`, the default for domain records.
    RowId,
    /// `id TEXT PRIMARY KEY` for branded ids (chat audit tables).
    Text,
}

/// Maps a record to the attributes interpolated into its prompts. Defaults to
/// every column value when absent.
pub type PromptAttrsFn = Arc<dyn Fn(&crate::records::Record) -> serde_json::Map<String, Value>>;

/// One record type declaration.
#[derive(Clone)]
pub struct RecordDecl {
    pub name: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<Vec<String>>,
    pub prompt_attrs: Option<PromptAttrsFn>,
    /// When set, the record carries a `reviews` JSON column and the review
    /// loop appends `{diff, feedbacks}` entries to it.
    pub reviews: bool,
}

impl std::fmt::Debug for RecordDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordDecl")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("columns", &self.columns.len())
            .field("reviews", &self.reviews)
            .finish()
    }
}

impl RecordDecl {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let table = format!("{name}s");
        Self {
            name,
            table,
            primary_key: PrimaryKey::RowId,
            columns: Vec::new(),
            indexes: Vec::new(),
            prompt_attrs: None,
            reviews: false,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn text_primary_key(mut self) -> Self {
        self.primary_key = PrimaryKey::Text;
        self
    }

    pub fn column(mut self, def: ColumnDef) -> Self {
        self.columns.push(def);
        self
    }

    pub fn text(self, name: &str) -> Self {
        self.column(ColumnDef::new(name, ColumnType::Text))
    }

    pub fn integer(self, name: &str) -> Self {
        self.column(ColumnDef::new(name, ColumnType::Integer))
    }

    pub fn real(self, name: &str) -> Self {
        self.column(ColumnDef::new(name, ColumnType::Real))
    }

    pub fn boolean(self, name: &str) -> Self {
        self.column(ColumnDef::new(name, ColumnType::Boolean))
    }

    pub fn json(self, name: &str) -> Self {
        self.column(ColumnDef::new(name, ColumnType::Json))
    }

    pub fn timestamps(self) -> Self {
        self.column(ColumnDef::new("created_at", ColumnType::Text).not_null())
            .column(ColumnDef::new("updated_at", ColumnType::Text).not_null())
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes
            .push(columns.iter().map(|c| (*c).to_string()).collect());
        self
    }

    pub fn prompt_attrs(mut self, f: PromptAttrsFn) -> Self {
        self.prompt_attrs = Some(f);
        self
    }

    /// Declare review support: adds a `reviews` JSON column and enables the
    /// review loop's per-round `add_review` append.
    pub fn with_reviews(mut self) -> Self {
        self.reviews = true;
        self.column(
            ColumnDef::new("reviews", ColumnType::Json)
                .not_null()
                .default_sql("'[]'"),
        )
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// CREATE TABLE + CREATE INDEX statements for this declaration.
    pub fn ddl(&self) -> String {
        let id_ddl = match self.primary_key {
            PrimaryKey::RowId => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            PrimaryKey::Text => "id TEXT PRIMARY KEY",
        };
        let mut cols = vec![id_ddl.to_string()];
        cols.extend(self.columns.iter().map(ColumnDef::ddl));
        let mut out = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            self.table,
            cols.join(",\n    ")
        );
        for index in &self.indexes {
            out.push_str(&format!(
                "\nCREATE INDEX IF NOT EXISTS idx_{}_{} ON {}({});",
                self.table,
                index.join("_"),
                self.table,
                index.join(", ")
            ));
        }
        out
    }

    /// Merge another declaration for the same record in: columns union by
    /// name with the newer definition winning, hooks concatenate (newer
    /// `prompt_attrs` wins), review support is sticky.
    pub fn merge(&mut self, other: RecordDecl) {
        for col in other.columns {
            if let Some(existing) = self.columns.iter_mut().find(|c| c.name == col.name) {
                *existing = col;
            } else {
                self.columns.push(col);
            }
        }
        for index in other.indexes {
            if !self.indexes.contains(&index) {
                self.indexes.push(index);
            }
        }
        if other.prompt_attrs.is_some() {
            self.prompt_attrs = other.prompt_attrs;
        }
        self.reviews |= other.reviews;
    }
}

/// Ordered collection of record declarations, merged by name.
#[derive(Clone, Debug, Default)]
pub struct SchemaSet {
    order: Vec<String>,
    decls: HashMap<String, RecordDecl>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, decl: RecordDecl) {
        match self.decls.get_mut(&decl.name) {
            Some(existing) => existing.merge(decl),
            None => {
                self.order.push(decl.name.clone());
                self.decls.insert(decl.name.clone(), decl);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&RecordDecl> {
        self.decls.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordDecl> {
        self.order.iter().filter_map(|name| self.decls.get(name))
    }
}

/// Built-in declarations every store carries: workspaces, tasks, and the
/// chat-audit tables.
pub fn builtin_decls() -> Vec<RecordDecl> {
    vec![
        RecordDecl::new("workspace")
            .column(ColumnDef::new("dir", ColumnType::Text).not_null().unique())
            .column(
                ColumnDef::new("env", ColumnType::Json)
                    .not_null()
                    .default_sql("'[]'"),
            )
            .column(ColumnDef::new("created_at", ColumnType::Text).not_null()),
        RecordDecl::new("task")
            .column(
                ColumnDef::new("status", ColumnType::Text)
                    .not_null()
                    .default_sql("'pending'"),
            )
            .column(
                ColumnDef::new("completed_steps", ColumnType::Json)
                    .not_null()
                    .default_sql("'[]'"),
            )
            .text("record_type")
            .integer("record_id")
            .integer("workspace_id")
            .text("handler")
            .text("error_message")
            .column(
                ColumnDef::new("chat_ids", ColumnType::Json)
                    .not_null()
                    .default_sql("'[]'"),
            )
            .timestamps()
            .index(&["status"])
            .index(&["workspace_id", "status"])
            .index(&["record_type", "record_id"]),
        RecordDecl::new("model")
            .column(ColumnDef::new("name", ColumnType::Text).not_null().unique()),
        RecordDecl::new("chat")
            .text_primary_key()
            .text("project")
            .text("run_id")
            .integer("model_id")
            .column(ColumnDef::new("created_at", ColumnType::Text).not_null())
            .index(&["project", "run_id"]),
        RecordDecl::new("message")
            .text_primary_key()
            .column(ColumnDef::new("chat_id", ColumnType::Text).not_null())
            .column(ColumnDef::new("role", ColumnType::Text).not_null())
            .column(ColumnDef::new("content", ColumnType::Text).not_null())
            .json("content_raw")
            .column(
                ColumnDef::new("input_tokens", ColumnType::Integer)
                    .not_null()
                    .default_sql("0"),
            )
            .column(
                ColumnDef::new("output_tokens", ColumnType::Integer)
                    .not_null()
                    .default_sql("0"),
            )
            .column(
                ColumnDef::new("cached_tokens", ColumnType::Integer)
                    .not_null()
                    .default_sql("0"),
            )
            .column(
                ColumnDef::new("cache_creation_tokens", ColumnType::Integer)
                    .not_null()
                    .default_sql("0"),
            )
            .column(ColumnDef::new("created_at", ColumnType::Text).not_null())
            .index(&["chat_id"]),
        RecordDecl::new("tool_call")
            .text_primary_key()
            .column(ColumnDef::new("message_id", ColumnType::Text).not_null())
            .column(ColumnDef::new("tool_call_id", ColumnType::Text).not_null())
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .json("arguments")
            .index(&["message_id"]),
    ]
}
