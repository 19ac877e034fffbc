//! Durable project/thread mapping store.
//!
//! One SQLite connection behind a mutex. Every public operation holds the lock
//! for its whole SQL sequence, so check-then-insert inside the store is atomic
//! for this process. Creation is insert-or-return-existing: a uniqueness
//! conflict means someone else already created the row, and the caller gets
//! the surviving row back.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use codexcord_protocol::{
    DeliveredMessage, MessageDirection, NewProject, ProjectRecord, ThreadRecord, ThreadStatus,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;
use tracing::{info, warn};

use crate::canonical::canonicalize_project_path;
use crate::migration_runner::run_migrations;

const PROJECT_COLUMNS: &str =
    "id, channel_id, path, name, model, approval_policy, created_at";
const THREAD_COLUMNS: &str =
    "id, chat_thread_id, session_id, project_id, name, status, created_at, updated_at";
const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("row missing after write: {0}")]
    Missing(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Result of the startup deduplication pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub merged_projects: usize,
    pub merged_threads: usize,
    pub repaired_paths: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.merged_projects == 0 && self.merged_threads == 0 && self.repaired_paths == 0
    }
}

pub struct MappingStore {
    conn: Mutex<Connection>,
}

impl MappingStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        run_migrations(&mut conn)?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        let report = store.reconcile()?;
        if !report.is_clean() {
            info!(
                component = "store",
                event = "store.reconciled",
                merged_projects = report.merged_projects,
                merged_threads = report.merged_threads,
                repaired_paths = report.repaired_paths,
                "Merged duplicate mappings"
            );
        }

        // Unique keys go on only after duplicates are gone.
        store.conn()?.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_path ON projects(path);
             CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_channel ON projects(channel_id);
             CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_chat ON threads(chat_thread_id);
             CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_session ON threads(session_id);",
        )?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // -- projects ---------------------------------------------------------

    /// Insert a project or return the one that already owns its canonical path.
    ///
    /// Callers compare `channel_id` on the returned row with the channel they
    /// created; a mismatch means they lost the race and must undo their side.
    pub fn create_project(&self, project: NewProject) -> Result<ProjectRecord, StoreError> {
        let canonical = canonicalize_project_path(&project.path);
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO projects (channel_id, path, name, model, approval_policy)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO NOTHING",
            params![
                project.channel_id,
                canonical,
                project.name,
                project.model,
                project.approval_policy
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_constraint_violation(&err) => {
                return Err(StoreError::Conflict(format!(
                    "channel {} is already mapped to another project",
                    project.channel_id
                )));
            }
            Err(err) => return Err(err.into()),
        }

        query_project(&conn, "path = ?1", &canonical)?
            .ok_or_else(|| StoreError::Missing(format!("project {canonical}")))
    }

    pub fn project_by_path(&self, path: &str) -> Result<Option<ProjectRecord>, StoreError> {
        let canonical = canonicalize_project_path(path);
        query_project(&*self.conn()?, "path = ?1", &canonical)
    }

    pub fn project_by_channel(&self, channel_id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        query_project(&*self.conn()?, "channel_id = ?1", channel_id)
    }

    pub fn project_by_id(&self, id: i64) -> Result<Option<ProjectRecord>, StoreError> {
        query_project(&*self.conn()?, "id = ?1", id)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"))?;
        let rows = stmt
            .query_map([], project_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fill the project's default model if it has none yet.
    pub fn set_project_model(&self, project_id: i64, model: &str) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE projects SET model = ?2 WHERE id = ?1 AND (model IS NULL OR model = '')",
            params![project_id, model],
        )?;
        Ok(changed > 0)
    }

    /// Delete a project and, by cascade, its threads and their messages.
    pub fn delete_project(&self, project_id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
        Ok(deleted > 0)
    }

    // -- threads ----------------------------------------------------------

    /// Insert a thread or return the existing mapping.
    ///
    /// Keyed by `session_id` when given, else by `chat_thread_id`. A chat-side
    /// row that was created before its session was known (same chat id, no
    /// session) is linked to `session_id` here.
    pub fn create_thread(
        &self,
        chat_thread_id: &str,
        project_id: i64,
        name: &str,
        session_id: Option<&str>,
    ) -> Result<ThreadRecord, StoreError> {
        let conn = self.conn()?;

        if let Some(session_id) = session_id {
            if let Some(existing) = query_thread(&conn, "session_id = ?1", session_id)? {
                return Ok(existing);
            }
            if let Some(existing) = query_thread(&conn, "chat_thread_id = ?1", chat_thread_id)? {
                if existing.session_id.is_some() {
                    return Ok(existing);
                }
                conn.execute(
                    &format!(
                        "UPDATE threads SET session_id = ?2, updated_at = {NOW} WHERE id = ?1"
                    ),
                    params![existing.id, session_id],
                )?;
                return query_thread(&conn, "id = ?1", existing.id)?
                    .ok_or_else(|| StoreError::Missing(format!("thread {}", existing.id)));
            }
        }

        conn.execute(
            "INSERT INTO threads (chat_thread_id, session_id, project_id, name)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![chat_thread_id, session_id, project_id, name],
        )?;

        let survivor = match session_id {
            Some(session_id) => query_thread(&conn, "session_id = ?1", session_id)?,
            None => query_thread(&conn, "chat_thread_id = ?1", chat_thread_id)?,
        };
        survivor.ok_or_else(|| StoreError::Missing(format!("thread {chat_thread_id}")))
    }

    pub fn thread_by_chat_id(&self, chat_thread_id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        query_thread(&*self.conn()?, "chat_thread_id = ?1", chat_thread_id)
    }

    pub fn thread_by_session(&self, session_id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        query_thread(&*self.conn()?, "session_id = ?1", session_id)
    }

    pub fn list_threads(&self, project_id: i64) -> Result<Vec<ThreadRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE project_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![project_id], thread_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every chat thread id currently mapped, linked or not.
    pub fn chat_thread_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT chat_thread_id FROM threads ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    pub fn mapped_session_ids(&self) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT session_id FROM threads WHERE session_id IS NOT NULL")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(rows)
    }

    /// Link a thread to its session. Fails with `Conflict` when another thread
    /// already owns the session id.
    pub fn update_session_id(&self, thread_id: i64, session_id: &str) -> Result<(), StoreError> {
        let result = self.conn()?.execute(
            &format!("UPDATE threads SET session_id = ?2, updated_at = {NOW} WHERE id = ?1"),
            params![thread_id, session_id],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(StoreError::Conflict(format!(
                "session {session_id} is already mapped"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub fn update_status(&self, thread_id: i64, status: ThreadStatus) -> Result<(), StoreError> {
        self.conn()?.execute(
            &format!("UPDATE threads SET status = ?2, updated_at = {NOW} WHERE id = ?1"),
            params![thread_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_thread_by_chat_id(&self, chat_thread_id: &str) -> Result<bool, StoreError> {
        let deleted = self.conn()?.execute(
            "DELETE FROM threads WHERE chat_thread_id = ?1",
            params![chat_thread_id],
        )?;
        Ok(deleted > 0)
    }

    // -- messages ---------------------------------------------------------

    pub fn record_message(
        &self,
        thread_id: i64,
        direction: MessageDirection,
        chat_message_id: Option<&str>,
        content: &str,
        event_type: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (thread_id, direction, chat_message_id, content, event_type)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread_id,
                direction.as_str(),
                chat_message_id,
                content,
                event_type
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn messages_for_thread(&self, thread_id: i64) -> Result<Vec<DeliveredMessage>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, direction, chat_message_id, content, event_type, created_at
             FROM messages WHERE thread_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![thread_id], |row| {
                let direction: String = row.get(2)?;
                Ok(DeliveredMessage {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    direction: MessageDirection::parse(&direction)
                        .unwrap_or(MessageDirection::Outbound),
                    chat_message_id: row.get(3)?,
                    content: row.get(4)?,
                    event_type: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn message_count(&self, thread_id: i64) -> Result<i64, StoreError> {
        let count = self.conn()?.query_row(
            "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- reconciliation ---------------------------------------------------

    /// Merge rows that should have been one.
    ///
    /// Projects whose paths canonicalize to the same directory collapse into
    /// the earliest row (threads re-pointed, stored path rewritten to the
    /// canonical form). Threads sharing a session id collapse into the
    /// earliest row (messages re-pointed). Runs in one transaction and is a
    /// no-op on a clean store.
    pub fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut report = ReconcileReport::default();

        let projects: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare("SELECT id, path, channel_id FROM projects ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut by_path: BTreeMap<String, Vec<(i64, String, String)>> = BTreeMap::new();
        for (id, path, channel_id) in projects {
            by_path
                .entry(canonicalize_project_path(&path))
                .or_default()
                .push((id, path, channel_id));
        }

        for (canonical, rows) in by_path {
            let Some(((winner_id, winner_path, _), losers)) = rows.split_first() else {
                continue;
            };
            for (loser_id, _, loser_channel) in losers {
                tx.execute(
                    "UPDATE threads SET project_id = ?1 WHERE project_id = ?2",
                    params![winner_id, loser_id],
                )?;
                tx.execute("DELETE FROM projects WHERE id = ?1", params![loser_id])?;
                warn!(
                    component = "store",
                    event = "store.project_merged",
                    kept_project_id = winner_id,
                    merged_project_id = loser_id,
                    orphaned_channel_id = %loser_channel,
                    path = %canonical,
                    "Merged duplicate project"
                );
                report.merged_projects += 1;
            }
            if *winner_path != canonical {
                tx.execute(
                    "UPDATE projects SET path = ?2 WHERE id = ?1",
                    params![winner_id, canonical],
                )?;
                report.repaired_paths += 1;
            }
        }

        let threads: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, session_id FROM threads WHERE session_id IS NOT NULL ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut by_session: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (id, session_id) in threads {
            by_session.entry(session_id).or_default().push(id);
        }
        for (session_id, ids) in by_session {
            let Some((winner_id, losers)) = ids.split_first() else {
                continue;
            };
            for loser_id in losers {
                tx.execute(
                    "UPDATE messages SET thread_id = ?1 WHERE thread_id = ?2",
                    params![winner_id, loser_id],
                )?;
                tx.execute("DELETE FROM threads WHERE id = ?1", params![loser_id])?;
                warn!(
                    component = "store",
                    event = "store.thread_merged",
                    kept_thread_id = winner_id,
                    merged_thread_id = loser_id,
                    session_id = %session_id,
                    "Merged duplicate thread"
                );
                report.merged_threads += 1;
            }
        }

        tx.commit()?;
        Ok(report)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn query_project<P: rusqlite::ToSql>(
    conn: &Connection,
    predicate: &str,
    value: P,
) -> Result<Option<ProjectRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE {predicate}"),
            params![value],
            project_from_row,
        )
        .optional()?;
    Ok(row)
}

fn query_thread<P: rusqlite::ToSql>(
    conn: &Connection,
    predicate: &str,
    value: P,
) -> Result<Option<ThreadRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE {predicate}"),
            params![value],
            thread_from_row,
        )
        .optional()?;
    Ok(row)
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        path: row.get(2)?,
        name: row.get(3)?,
        model: row.get(4)?,
        approval_policy: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let status: String = row.get(5)?;
    Ok(ThreadRecord {
        id: row.get(0)?,
        chat_thread_id: row.get(1)?,
        session_id: row.get(2)?,
        project_id: row.get(3)?,
        name: row.get(4)?,
        status: ThreadStatus::parse(&status).unwrap_or(ThreadStatus::Active),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn new_project(channel_id: &str, path: &str) -> NewProject {
        NewProject {
            channel_id: channel_id.to_string(),
            path: path.to_string(),
            name: "api".to_string(),
            model: None,
            approval_policy: None,
        }
    }

    #[test]
    fn create_project_returns_existing_row_on_path_conflict() {
        let store = MappingStore::open_in_memory().expect("open");
        let first = store
            .create_project(new_project("c1", "/srv/api"))
            .expect("first");
        let second = store
            .create_project(new_project("c2", "/srv/api/"))
            .expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(second.channel_id, "c1");
        assert_eq!(store.list_projects().expect("list").len(), 1);
    }

    #[test]
    fn channel_reuse_across_paths_is_a_conflict() {
        let store = MappingStore::open_in_memory().expect("open");
        store
            .create_project(new_project("c1", "/srv/api"))
            .expect("first");
        let err = store
            .create_project(new_project("c1", "/srv/web"))
            .expect_err("same channel, different path");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn concurrent_project_creators_converge() {
        let store = Arc::new(MappingStore::open_in_memory().expect("open"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .create_project(new_project(&format!("c{i}"), "/srv/api"))
                        .expect("create")
                })
            })
            .collect();

        let rows: Vec<ProjectRecord> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        let winner = &rows[0];
        assert!(rows.iter().all(|r| r.id == winner.id && r.channel_id == winner.channel_id));
        assert_eq!(store.list_projects().expect("list").len(), 1);
    }

    #[test]
    fn create_thread_is_idempotent_per_session() {
        let store = MappingStore::open_in_memory().expect("open");
        let project = store
            .create_project(new_project("c1", "/srv/api"))
            .expect("project");

        let first = store
            .create_thread("t1", project.id, "fix build", Some("s1"))
            .expect("first");
        let second = store
            .create_thread("t2", project.id, "fix build", Some("s1"))
            .expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(second.chat_thread_id, "t1");
        assert!(store.thread_by_chat_id("t2").expect("lookup").is_none());
    }

    #[test]
    fn chat_side_thread_is_linked_when_session_arrives() {
        let store = MappingStore::open_in_memory().expect("open");
        let project = store
            .create_project(new_project("c1", "/srv/api"))
            .expect("project");

        let unlinked = store
            .create_thread("t1", project.id, "from chat", None)
            .expect("unlinked");
        assert!(unlinked.session_id.is_none());

        let linked = store
            .create_thread("t1", project.id, "from tail", Some("s1"))
            .expect("linked");
        assert_eq!(linked.id, unlinked.id);
        assert_eq!(linked.session_id.as_deref(), Some("s1"));
        assert_eq!(
            store.thread_by_session("s1").expect("lookup").map(|t| t.id),
            Some(unlinked.id)
        );
    }

    #[test]
    fn session_id_updates_and_conflicts() {
        let store = MappingStore::open_in_memory().expect("open");
        let project = store
            .create_project(new_project("c1", "/srv/api"))
            .expect("project");
        let a = store.create_thread("t1", project.id, "a", None).expect("a");
        let b = store.create_thread("t2", project.id, "b", None).expect("b");

        store.update_session_id(a.id, "s1").expect("link a");
        let err = store.update_session_id(b.id, "s1").expect_err("dup session");
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .update_status(a.id, ThreadStatus::Completed)
            .expect("status");
        let a = store.thread_by_session("s1").expect("lookup").expect("row");
        assert_eq!(a.status, ThreadStatus::Completed);
        assert_eq!(
            store.mapped_session_ids().expect("ids"),
            HashSet::from(["s1".to_string()])
        );
    }

    #[test]
    fn deleting_a_project_cascades() {
        let store = MappingStore::open_in_memory().expect("open");
        let project = store
            .create_project(new_project("c1", "/srv/api"))
            .expect("project");
        let thread = store
            .create_thread("t1", project.id, "a", Some("s1"))
            .expect("thread");
        store
            .record_message(thread.id, MessageDirection::Outbound, Some("m1"), "hi", "agent_message")
            .expect("message");

        assert!(store.delete_project(project.id).expect("delete"));
        assert!(store.thread_by_chat_id("t1").expect("lookup").is_none());
        assert_eq!(store.message_count(thread.id).expect("count"), 0);
    }

    #[test]
    fn project_model_is_only_filled_once() {
        let store = MappingStore::open_in_memory().expect("open");
        let project = store
            .create_project(new_project("c1", "/srv/api"))
            .expect("project");
        assert!(store.set_project_model(project.id, "gpt-5").expect("fill"));
        assert!(!store.set_project_model(project.id, "o3").expect("keep"));
        let project = store.project_by_id(project.id).expect("lookup").expect("row");
        assert_eq!(project.model.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn reconcile_merges_legacy_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("codexcord.db");
        let project_dir = dir.path().join("api");
        std::fs::create_dir(&project_dir).expect("mkdir");
        let canonical = canonicalize_project_path(&project_dir.to_string_lossy());

        {
            // A store written before paths were canonicalized and before
            // unique keys existed.
            let mut conn = Connection::open(&db).expect("open raw");
            run_migrations(&mut conn).expect("migrate");
            conn.execute_batch(&format!(
                "INSERT INTO projects (id, channel_id, path, name) VALUES
                    (1, 'c1', '{dir}', 'api'),
                    (2, 'c2', '{dir}/', 'api'),
                    (3, 'c3', '{dir}/./', 'api');
                 INSERT INTO threads (id, chat_thread_id, session_id, project_id, name) VALUES
                    (10, 't10', 's1', 1, 'first'),
                    (11, 't11', 's1', 2, 'dup'),
                    (12, 't12', 's2', 3, 'other');
                 INSERT INTO messages (thread_id, direction, content, event_type) VALUES
                    (11, 'outbound', 'hello', 'agent_message');",
                dir = project_dir.display()
            ))
            .expect("seed");
        }

        let store = MappingStore::open(&db).expect("open store");
        let projects = store.list_projects().expect("list");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, 1);
        assert_eq!(projects[0].path, canonical);

        let threads = store.list_threads(1).expect("threads");
        let ids: Vec<i64> = threads.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![10, 12]);
        assert_eq!(store.message_count(10).expect("count"), 1);

        // Idempotent on every later start.
        assert!(store.reconcile().expect("second pass").is_clean());
        drop(store);
        let reopened = MappingStore::open(&db).expect("reopen");
        assert_eq!(reopened.list_projects().expect("list").len(), 1);
    }
}
