use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, sync::Mutex, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{BibleFields, CharacterSummary, TelemetryRecord};

/**
 * \brief 存储协作方接口：按项目读取故事圣经与角色，追加写入 AI 遥测。
 * \details user_id 给定时按所有者过滤。
 */
pub trait StoryStore: Send + Sync {
    fn fetch_bible(&self, project_id: &str, user_id: Option<&str>) -> Result<Option<BibleFields>>;

    fn fetch_characters(
        &self,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<CharacterSummary>>;

    fn insert_ai_history(&self, record: &TelemetryRecord) -> Result<i64>;
}

/**
 * \brief ai_history 中读回的一行。
 */
#[derive(Debug, Clone)]
pub struct StoredHistory {
    pub id: i64,
    pub record: TelemetryRecord,
    pub created_at: String,
}

/**
 * \brief 基于 SQLite 的存储实现。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开数据库文件并执行迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))?;
        f(&guard)
    }

    /**
     * \brief 写入或覆盖项目的故事圣经。
     */
    pub fn upsert_bible(&self, project_id: &str, user_id: &str, bible: &BibleFields) -> Result<()> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO story_bibles (project_id, user_id, braindump, genre, style, synopsis,
                        setting, worldbuilding, outline, pov, tense, style_sample, prose_mode)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(project_id) DO UPDATE SET
                        user_id=excluded.user_id, braindump=excluded.braindump,
                        genre=excluded.genre, style=excluded.style, synopsis=excluded.synopsis,
                        setting=excluded.setting, worldbuilding=excluded.worldbuilding,
                        outline=excluded.outline, pov=excluded.pov, tense=excluded.tense,
                        style_sample=excluded.style_sample, prose_mode=excluded.prose_mode",
                    params![
                        project_id,
                        user_id,
                        bible.braindump,
                        bible.genre,
                        bible.style,
                        bible.synopsis,
                        bible.setting,
                        bible.worldbuilding,
                        bible.outline,
                        bible.pov,
                        bible.tense,
                        bible.style_sample,
                        bible.prose_mode
                    ],
                )
            })?;
            Ok(())
        })
    }

    /**
     * \brief 新增角色。
     */
    pub fn insert_character(
        &self,
        project_id: &str,
        user_id: &str,
        character: &CharacterSummary,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO characters (project_id, user_id, name, role, description)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        project_id,
                        user_id,
                        character.name,
                        character.role,
                        character.description
                    ],
                )
            })?;
            Ok(conn.last_insert_rowid())
        })
    }

    /**
     * \brief 按所有者与项目读取遥测历史，按写入顺序返回。
     */
    pub fn list_ai_history(&self, user_id: &str, project_id: &str) -> Result<Vec<StoredHistory>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, project_id, document_id, feature, prompt, result, model,
                        tokens_used, latency_ms, output_chars, response_fingerprint, created_at
                 FROM ai_history WHERE user_id=?1 AND project_id=?2 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id, project_id], |row| {
                    Ok(StoredHistory {
                        id: row.get(0)?,
                        record: TelemetryRecord {
                            user_id: row.get(1)?,
                            project_id: row.get(2)?,
                            document_id: row.get(3)?,
                            feature: row.get(4)?,
                            prompt: row.get(5)?,
                            result: row.get(6)?,
                            model: row.get(7)?,
                            tokens_used: row.get(8)?,
                            latency_ms: row.get(9)?,
                            output_chars: row.get(10)?,
                            response_fingerprint: row.get(11)?,
                        },
                        created_at: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl StoryStore for SqliteStore {
    fn fetch_bible(&self, project_id: &str, user_id: Option<&str>) -> Result<Option<BibleFields>> {
        self.with_conn(|conn| {
            let bible = conn
                .query_row(
                    "SELECT braindump, genre, style, synopsis, setting, worldbuilding, outline,
                            pov, tense, style_sample, prose_mode
                     FROM story_bibles
                     WHERE project_id=?1 AND (?2 IS NULL OR user_id=?2)",
                    params![project_id, user_id],
                    |row| {
                        Ok(BibleFields {
                            braindump: row.get(0)?,
                            genre: row.get(1)?,
                            style: row.get(2)?,
                            synopsis: row.get(3)?,
                            setting: row.get(4)?,
                            worldbuilding: row.get(5)?,
                            outline: row.get(6)?,
                            pov: row.get(7)?,
                            tense: row.get(8)?,
                            style_sample: row.get(9)?,
                            prose_mode: row.get(10)?,
                        })
                    },
                )
                .optional()?;
            Ok(bible)
        })
    }

    fn fetch_characters(
        &self,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<Vec<CharacterSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, role, description FROM characters
                 WHERE project_id=?1 AND (?2 IS NULL OR user_id=?2)
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![project_id, user_id], |row| {
                    Ok(CharacterSummary {
                        name: row.get(0)?,
                        role: row.get(1)?,
                        description: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn insert_ai_history(&self, record: &TelemetryRecord) -> Result<i64> {
        let created_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO ai_history (user_id, project_id, document_id, feature, prompt,
                        result, model, tokens_used, latency_ms, output_chars,
                        response_fingerprint, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        record.user_id,
                        record.project_id,
                        record.document_id,
                        record.feature,
                        record.prompt,
                        record.result,
                        record.model,
                        record.tokens_used,
                        record.latency_ms,
                        record.output_chars,
                        record.response_fingerprint,
                        created_at
                    ],
                )
            })?;
            Ok(conn.last_insert_rowid())
        })
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS story_bibles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            braindump TEXT,
            genre TEXT,
            style TEXT,
            synopsis TEXT,
            setting TEXT,
            worldbuilding TEXT,
            outline TEXT,
            pov TEXT,
            tense TEXT,
            style_sample TEXT,
            prose_mode TEXT
        );

        CREATE TABLE IF NOT EXISTS characters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            role TEXT,
            description TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_characters_project ON characters(project_id);

        CREATE TABLE IF NOT EXISTS ai_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            document_id TEXT,
            feature TEXT NOT NULL,
            prompt TEXT NOT NULL,
            result TEXT NOT NULL,
            model TEXT NOT NULL,
            tokens_used INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            output_chars INTEGER NOT NULL,
            response_fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
