//! Colibri Storage
//!
//! SQLite persistence for per-chat configuration, rolling message history
//! and pending-retry payloads

use anyhow::{anyhow, Result};
use rusqlite::OptionalExtension;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "Eres un asistente útil que responde de manera clara y concisa.";
pub const DEFAULT_VOICE: &str = "Kore";

/// Per-chat configuration row. Absence of a row means "use defaults";
/// the first write materializes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub chat_id: String,
    pub title: String,
    pub system_prompt: String,
    pub audio_mode: bool,
    pub textfile_mode: bool,
    pub voice_name: String,
}

impl ChatConfig {
    pub fn with_defaults(chat_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            title: title.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            audio_mode: false,
            textfile_mode: false,
            voice_name: DEFAULT_VOICE.to_string(),
        }
    }

    pub fn has_custom_prompt(&self) -> bool {
        self.system_prompt != DEFAULT_SYSTEM_PROMPT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow!("unknown message role '{}'", other)),
        }
    }
}

/// One history entry, as returned by [`Storage::get_history`]
/// (most recent first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub content: String,
    pub role: Role,
}

pub struct Storage {
    conn: rusqlite::Connection,
}

impl Storage {
    /// Opens the database, bootstrapping the schema idempotently.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chats (
                chat_id TEXT PRIMARY KEY,
                title TEXT,
                prompt TEXT NOT NULL,
                audio_mode INTEGER NOT NULL DEFAULT 0,
                textfile_mode INTEGER NOT NULL DEFAULT 0,
                voice_name TEXT NOT NULL DEFAULT 'Kore',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id TEXT NOT NULL,
                content TEXT NOT NULL,
                role TEXT NOT NULL,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, id);

            CREATE TABLE IF NOT EXISTS pending_retries (
                chat_id TEXT PRIMARY KEY,
                messages_json TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            ",
        )?;

        Ok(Self { conn })
    }

    pub fn get_config(&self, chat_id: &str) -> Result<Option<ChatConfig>> {
        let mut stmt = self.conn.prepare(
            "SELECT title, prompt, audio_mode, textfile_mode, voice_name
             FROM chats WHERE chat_id = ?1",
        )?;
        let config = stmt
            .query_row([chat_id], |row| {
                Ok(ChatConfig {
                    chat_id: chat_id.to_string(),
                    title: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    system_prompt: row.get(1)?,
                    audio_mode: row.get(2)?,
                    textfile_mode: row.get(3)?,
                    voice_name: row.get(4)?,
                })
            })
            .optional()?;
        Ok(config)
    }

    /// Full upsert: callers read-modify-write, merging unspecified fields
    /// from the current row or defaults. `created_at` is kept on update.
    pub fn save_config(&self, config: &ChatConfig) -> Result<()> {
        self.conn.execute(
            "INSERT INTO chats (chat_id, title, prompt, audio_mode, textfile_mode, voice_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(chat_id) DO UPDATE SET
                 title = excluded.title,
                 prompt = excluded.prompt,
                 audio_mode = excluded.audio_mode,
                 textfile_mode = excluded.textfile_mode,
                 voice_name = excluded.voice_name",
            (
                &config.chat_id,
                &config.title,
                &config.system_prompt,
                config.audio_mode,
                config.textfile_mode,
                &config.voice_name,
            ),
        )?;
        Ok(())
    }

    pub fn append_message(&self, chat_id: &str, content: &str, role: Role) -> Result<()> {
        self.conn.execute(
            "INSERT INTO messages (chat_id, content, role) VALUES (?1, ?2, ?3)",
            (chat_id, content, role.as_str()),
        )?;
        Ok(())
    }

    /// Most recent `limit` messages, newest first. Callers re-reverse to
    /// chronological order before assembling a prompt.
    pub fn get_history(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT content, role FROM messages
             WHERE chat_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map((chat_id, limit as i64), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (content, role) = row?;
            result.push(StoredMessage {
                content,
                role: Role::parse(&role)?,
            });
        }
        Ok(result)
    }

    /// Removes all history rows and any pending retry for the chat.
    /// The configuration row is untouched.
    pub fn clear_history(&self, chat_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id])?;
        self.conn
            .execute("DELETE FROM pending_retries WHERE chat_id = ?1", [chat_id])?;
        Ok(())
    }

    /// Upserts the JSON-encoded turn sequence about to be submitted to the
    /// text adapter. Overwritten on each new attempt, single row per chat.
    pub fn save_pending_request(&self, chat_id: &str, messages_json: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_retries (chat_id, messages_json)
             VALUES (?1, ?2)
             ON CONFLICT(chat_id) DO UPDATE SET
                 messages_json = excluded.messages_json,
                 created_at = CURRENT_TIMESTAMP",
            (chat_id, messages_json),
        )?;
        Ok(())
    }

    pub fn get_pending_request(&self, chat_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT messages_json FROM pending_retries WHERE chat_id = ?1")?;
        let value = stmt.query_row([chat_id], |row| row.get(0)).optional()?;
        Ok(value)
    }

    pub fn clear_pending_request(&self, chat_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_retries WHERE chat_id = ?1", [chat_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("colibri-storage-{}-{}.db", name, ts))
    }

    fn open(name: &str) -> Storage {
        Storage::new(temp_db_path(name)).expect("storage init")
    }

    #[test]
    fn unknown_chat_has_no_config_row() {
        let storage = open("absent");
        assert!(storage.get_config("nobody").expect("query").is_none());
    }

    #[test]
    fn first_materialization_writes_documented_defaults() {
        let storage = open("defaults");
        storage
            .save_config(&ChatConfig::with_defaults("c1", "Chat privado"))
            .expect("save");
        let config = storage.get_config("c1").expect("query").expect("row");
        assert!(!config.audio_mode);
        assert!(!config.textfile_mode);
        assert_eq!(config.voice_name, "Kore");
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert!(!config.has_custom_prompt());
    }

    #[test]
    fn save_config_twice_leaves_one_row() {
        let storage = open("idempotent");
        let config = ChatConfig::with_defaults("c1", "t");
        storage.save_config(&config).expect("save 1");
        storage.save_config(&config).expect("save 2");
        let count: i64 = storage
            .conn
            .query_row("SELECT COUNT(*) FROM chats WHERE chat_id = 'c1'", [], |r| {
                r.get(0)
            })
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn upsert_preserves_unspecified_fields_via_read_modify_write() {
        let storage = open("rmw");
        storage
            .save_config(&ChatConfig::with_defaults("c1", "t"))
            .expect("save");
        let mut config = storage.get_config("c1").expect("query").expect("row");
        config.audio_mode = true;
        storage.save_config(&config).expect("update");
        let updated = storage.get_config("c1").expect("query").expect("row");
        assert!(updated.audio_mode);
        assert_eq!(updated.voice_name, "Kore");
        assert_eq!(updated.title, "t");
    }

    #[test]
    fn history_is_most_recent_first_and_reversible() {
        let storage = open("history");
        storage.append_message("c1", "hi", Role::User).expect("hi");
        storage
            .append_message("c1", "yo", Role::Assistant)
            .expect("yo");

        let history = storage.get_history("c1", 20).expect("history");
        assert_eq!(
            history,
            vec![
                StoredMessage {
                    content: "yo".to_string(),
                    role: Role::Assistant
                },
                StoredMessage {
                    content: "hi".to_string(),
                    role: Role::User
                },
            ]
        );

        let chronological: Vec<_> = history.into_iter().rev().collect();
        assert_eq!(chronological[0].content, "hi");
        assert_eq!(chronological[1].content, "yo");
    }

    #[test]
    fn history_respects_limit() {
        let storage = open("limit");
        for i in 0..30 {
            storage
                .append_message("c1", &format!("m{}", i), Role::User)
                .expect("append");
        }
        let history = storage.get_history("c1", 20).expect("history");
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].content, "m29");
    }

    #[test]
    fn history_is_scoped_per_chat() {
        let storage = open("scoped");
        storage.append_message("a", "one", Role::User).expect("a");
        storage.append_message("b", "two", Role::User).expect("b");
        let history = storage.get_history("a", 20).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "one");
    }

    #[test]
    fn clear_removes_history_and_pending_but_not_config() {
        let storage = open("clear");
        storage
            .save_config(&ChatConfig::with_defaults("c1", "t"))
            .expect("save");
        storage.append_message("c1", "hi", Role::User).expect("msg");
        storage
            .save_pending_request("c1", r#"[{"role":"user","parts":[{"text":"hi"}]}]"#)
            .expect("pending");

        storage.clear_history("c1").expect("clear");

        assert!(storage.get_history("c1", 20).expect("history").is_empty());
        assert!(storage
            .get_pending_request("c1")
            .expect("pending")
            .is_none());
        assert!(storage.get_config("c1").expect("config").is_some());
    }

    #[test]
    fn pending_request_is_overwritten_not_appended() {
        let storage = open("pending");
        storage.save_pending_request("c1", "[1]").expect("first");
        storage.save_pending_request("c1", "[2]").expect("second");
        assert_eq!(
            storage.get_pending_request("c1").expect("get").as_deref(),
            Some("[2]")
        );
        let count: i64 = storage
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pending_retries WHERE chat_id = 'c1'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);

        storage.clear_pending_request("c1").expect("clear");
        assert!(storage
            .get_pending_request("c1")
            .expect("get")
            .is_none());
    }

    #[test]
    fn role_parse_rejects_unknown_values() {
        assert!(Role::parse("system").is_err());
        assert_eq!(Role::parse("user").expect("user"), Role::User);
        assert_eq!(Role::parse("assistant").expect("assistant"), Role::Assistant);
    }
}
