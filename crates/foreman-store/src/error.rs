#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid store config: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("read-only store: {0}")]
    ReadOnly(String),

    #[error("unknown record type: {0}")]
    UnknownRecord(String),

    #[error("migration {version} failed: {detail}")]
    Migration { version: String, detail: String },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl StoreError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::ReadOnly(_) => "read_only",
            Self::UnknownRecord(_) => "unknown_record",
            Self::Migration { .. } => "migration",
            Self::CorruptRow { .. } => "corrupt_row",
        }
    }
}
