//! Chat-audit persistence: chats, messages, models, tool calls. Written by
//! the session as exchanges happen, read by cost oracles; never mutated by
//! the pipeline runtime.

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use foreman_core::ids::{ChatId, MessageId, ToolCallId};
use foreman_core::{ChatMessage, Role};

use crate::error::StoreError;
use crate::row_helpers::{get, get_opt, parse_enum, parse_json};
use crate::util::now_rfc3339;

#[derive(Clone, Debug)]
pub struct ModelRow {
    pub id: i64,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct ChatRow {
    pub id: String,
    pub project: Option<String>,
    pub run_id: Option<String>,
    pub model_id: Option<i64>,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub content_raw: Option<Value>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct ToolCallRow {
    pub id: String,
    pub message_id: String,
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Option<Value>,
}

fn decode_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role_raw: String = get(row, "messages", "role")?;
    let raw: Option<String> = get_opt(row, "messages", "content_raw")?;
    let content_raw = raw
        .map(|r| parse_json(&r, "messages", "content_raw"))
        .transpose()?;
    Ok(MessageRow {
        id: get(row, "messages", "id")?,
        chat_id: get(row, "messages", "chat_id")?,
        role: parse_enum(&role_raw, "messages", "role")?,
        content: get(row, "messages", "content")?,
        content_raw,
        input_tokens: get(row, "messages", "input_tokens")?,
        output_tokens: get(row, "messages", "output_tokens")?,
        cached_tokens: get(row, "messages", "cached_tokens")?,
        cache_creation_tokens: get(row, "messages", "cache_creation_tokens")?,
        created_at: get(row, "messages", "created_at")?,
    })
}

pub struct ChatRepo;

impl ChatRepo {
    pub fn find_or_create_model(conn: &Connection, name: &str) -> Result<ModelRow, StoreError> {
        let existing = conn
            .query_row(
                "SELECT id, name FROM models WHERE name = ?1",
                [name],
                |row| {
                    Ok(ModelRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        if let Some(model) = existing {
            return Ok(model);
        }
        conn.execute("INSERT INTO models (name) VALUES (?1)", [name])?;
        Ok(ModelRow {
            id: conn.last_insert_rowid(),
            name: name.to_owned(),
        })
    }

    pub fn create_chat(
        conn: &Connection,
        id: &str,
        project: &str,
        run_id: &str,
        model_name: Option<&str>,
    ) -> Result<ChatRow, StoreError> {
        if !ChatId::from_raw(id).is_branded() {
            debug!(chat_id = id, "recording chat id from a foreign adapter");
        }
        let model_id = model_name
            .map(|name| Self::find_or_create_model(conn, name).map(|m| m.id))
            .transpose()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO chats (id, project, run_id, model_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, project, run_id, model_id, now],
        )?;
        Ok(ChatRow {
            id: id.to_owned(),
            project: Some(project.to_owned()),
            run_id: Some(run_id.to_owned()),
            model_id,
            created_at: now,
        })
    }

    pub fn find_chat(conn: &Connection, id: &str) -> Result<Option<ChatRow>, StoreError> {
        Ok(conn
            .query_row(
                "SELECT id, project, run_id, model_id, created_at FROM chats WHERE id = ?1",
                [id],
                |row| {
                    Ok(ChatRow {
                        id: row.get(0)?,
                        project: row.get(1)?,
                        run_id: row.get(2)?,
                        model_id: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn append_message(
        conn: &Connection,
        chat_id: &str,
        message: &ChatMessage,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let content_raw = message
            .content_raw
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO messages (id, chat_id, role, content, content_raw, input_tokens, \
             output_tokens, cached_tokens, cache_creation_tokens, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                id.as_str(),
                chat_id,
                message.role.as_sql(),
                message.content,
                content_raw,
                message.usage.input_tokens,
                message.usage.output_tokens,
                message.usage.cached_tokens,
                message.usage.cache_creation_tokens,
                now,
            ],
        )?;
        Ok(MessageRow {
            id: id.as_str().to_owned(),
            chat_id: chat_id.to_owned(),
            role: message.role,
            content: message.content.clone(),
            content_raw: message.content_raw.clone(),
            input_tokens: message.usage.input_tokens,
            output_tokens: message.usage.output_tokens,
            cached_tokens: message.usage.cached_tokens,
            cache_creation_tokens: message.usage.cache_creation_tokens,
            created_at: now,
        })
    }

    pub fn record_tool_call(
        conn: &Connection,
        message_id: &str,
        tool_call_id: &str,
        name: &str,
        arguments: Option<&Value>,
    ) -> Result<ToolCallRow, StoreError> {
        let id = ToolCallId::new();
        let arguments_json = arguments.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO tool_calls (id, message_id, tool_call_id, name, arguments) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id.as_str(), message_id, tool_call_id, name, arguments_json],
        )?;
        Ok(ToolCallRow {
            id: id.as_str().to_owned(),
            message_id: message_id.to_owned(),
            tool_call_id: tool_call_id.to_owned(),
            name: name.to_owned(),
            arguments: arguments.cloned(),
        })
    }

    pub fn messages(conn: &Connection, chat_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, content, content_raw, input_tokens, output_tokens, \
             cached_tokens, cache_creation_tokens, created_at FROM messages \
             WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([chat_id], |row| Ok(decode_message(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use crate::schema::{builtin_decls, SchemaSet};
    use foreman_core::TokenUsage;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let mut schema = SchemaSet::new();
        for decl in builtin_decls() {
            schema.declare(decl);
        }
        migrations::run(&conn, &migrations::schema_migrations(&schema)).unwrap();
        conn
    }

    #[test]
    fn model_find_or_create_dedupes() {
        let conn = setup();
        let a = ChatRepo::find_or_create_model(&conn, "sonnet").unwrap();
        let b = ChatRepo::find_or_create_model(&conn, "sonnet").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn chat_with_model_and_messages() {
        let conn = setup();
        let chat = ChatRepo::create_chat(&conn, "chat_1", "blog", "1722600000", Some("sonnet"))
            .unwrap();
        assert!(chat.model_id.is_some());

        let mut message = ChatMessage::assistant("{\"ok\":true}");
        message.content_raw = Some(serde_json::json!({"ok": true}));
        message.usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cached_tokens: 50,
            cache_creation_tokens: 0,
        };
        ChatRepo::append_message(&conn, "chat_1", &ChatMessage::user("prompt")).unwrap();
        let stored = ChatRepo::append_message(&conn, "chat_1", &message).unwrap();
        assert!(stored.id.starts_with("msg_"));

        let messages = ChatRepo::messages(&conn, "chat_1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].input_tokens, 100);
        assert_eq!(messages[1].content_raw, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn find_chat_roundtrip() {
        let conn = setup();
        ChatRepo::create_chat(&conn, "chat_2", "blog", "r", None).unwrap();
        let found = ChatRepo::find_chat(&conn, "chat_2").unwrap().unwrap();
        assert_eq!(found.project.as_deref(), Some("blog"));
        assert!(found.model_id.is_none());
        assert!(ChatRepo::find_chat(&conn, "chat_missing").unwrap().is_none());
    }

    #[test]
    fn tool_call_rows_link_to_message() {
        let conn = setup();
        ChatRepo::create_chat(&conn, "chat_3", "blog", "r", None).unwrap();
        let message = ChatRepo::append_message(&conn, "chat_3", &ChatMessage::assistant("x"))
            .unwrap();
        let tc = ChatRepo::record_tool_call(
            &conn,
            &message.id,
            "toolu_raw_1",
            "read",
            Some(&serde_json::json!({"path": "a.txt"})),
        )
        .unwrap();
        assert!(tc.id.starts_with("toolu_"));
        assert_eq!(tc.arguments.unwrap()["path"], "a.txt");
    }
}
