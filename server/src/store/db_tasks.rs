//! Task table operations
//!
//! A task is created `pending` in the same transaction that queues its
//! campaign lead. The agent-pull path flips it to `in_progress`; completion,
//! failure, the stale-task sweep, and the operator reset drive it terminal.
//! All transitions are conditional on the current status.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::api::{CompletionReport, FailureReport};
use shared::model::{Task, TaskStatus, TaskType};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            task_type TEXT NOT NULL DEFAULT 'send_direct_message',
            target_username TEXT NOT NULL,
            message TEXT NOT NULL,
            sender_id TEXT,
            campaign_id TEXT,
            campaign_lead_id TEXT,
            outbound_lead_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            failed_at INTEGER,
            result TEXT,
            error TEXT,
            FOREIGN KEY (account_id) REFERENCES accounts (id)
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_account_status
         ON tasks(account_id, status, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_sender_campaign
         ON tasks(sender_id, campaign_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_created
         ON tasks(status, created_at)",
        [],
    )?;

    Ok(())
}

const COLUMNS: &str = "id, account_id, task_type, target_username, message, sender_id, \
                       campaign_id, campaign_lead_id, outbound_lead_id, status, attempts, \
                       created_at, started_at, completed_at, failed_at, result, error";

fn map_row(row: &Row) -> rusqlite::Result<Task> {
    let type_text: String = row.get(2)?;
    let status_text: String = row.get(9)?;
    let result_json: Option<String> = row.get(15)?;
    let error_json: Option<String> = row.get(16)?;

    Ok(Task {
        id: row.get(0)?,
        account_id: row.get(1)?,
        task_type: TaskType::parse(&type_text).unwrap_or(TaskType::SendDirectMessage),
        target_username: row.get(3)?,
        message: row.get(4)?,
        sender_id: row.get(5)?,
        campaign_id: row.get(6)?,
        campaign_lead_id: row.get(7)?,
        outbound_lead_id: row.get(8)?,
        status: TaskStatus::parse(&status_text).unwrap_or(TaskStatus::Pending),
        attempts: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        failed_at: row.get(14)?,
        result: result_json.and_then(|j| serde_json::from_str(&j).ok()),
        error: error_json.and_then(|j| serde_json::from_str(&j).ok()),
    })
}

pub fn insert(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO tasks
            (id, account_id, task_type, target_username, message, sender_id, campaign_id,
             campaign_lead_id, outbound_lead_id, status, attempts, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            task.id,
            task.account_id,
            task.task_type.as_str(),
            task.target_username,
            task.message,
            task.sender_id,
            task.campaign_id,
            task.campaign_lead_id,
            task.outbound_lead_id,
            task.status.as_str(),
            task.attempts,
            task.created_at
        ],
    )
    .with_context(|| format!("Failed to insert task: {}", task.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load task: {}", id))?;
    Ok(task)
}

/// Whether a task for this (sender, campaign) pair is pending or running.
pub fn has_open_for(conn: &Connection, sender_id: &str, campaign_id: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE sender_id = ?1 AND campaign_id = ?2 AND status IN ('pending', 'in_progress')
            "#,
            params![sender_id, campaign_id],
            |row| row.get(0),
        )
        .with_context(|| {
            format!(
                "Failed to check open tasks for sender {} in campaign {}",
                sender_id, campaign_id
            )
        })?;
    Ok(count > 0)
}

/// Atomically pick up the oldest pending task for an account.
///
/// When `sender_id` is given, only tasks assigned to that sender or to no
/// sender are considered. The flip to `in_progress` is conditional on the
/// task still being pending, so a concurrent sweep or reset wins cleanly.
pub fn pickup_next(
    conn: &Connection,
    account_id: &str,
    sender_id: Option<&str>,
    now: i64,
) -> Result<Option<Task>> {
    let candidate: Option<String> = match sender_id {
        Some(sid) => conn.query_row(
            r#"
            SELECT id FROM tasks
            WHERE account_id = ?1 AND status = 'pending'
              AND (sender_id = ?2 OR sender_id IS NULL)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
            params![account_id, sid],
            |row| row.get(0),
        ),
        None => conn.query_row(
            r#"
            SELECT id FROM tasks
            WHERE account_id = ?1 AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
            params![account_id],
            |row| row.get(0),
        ),
    }
    .optional()
    .with_context(|| format!("Failed to select pending task for account: {}", account_id))?;

    let Some(task_id) = candidate else {
        return Ok(None);
    };

    let updated = conn.execute(
        r#"
        UPDATE tasks
        SET status = 'in_progress', started_at = ?1, attempts = attempts + 1
        WHERE id = ?2 AND status = 'pending'
        "#,
        params![now, task_id],
    )?;
    if updated == 0 {
        return Ok(None);
    }

    get(conn, &task_id)
}

/// Terminal completion. Conditional on the task still being open so a
/// replayed report or a lost race against the stale sweep is a no-op.
pub fn complete(
    conn: &Connection,
    id: &str,
    result: &CompletionReport,
    now: i64,
) -> Result<bool> {
    let result_json = serde_json::to_string(result).context("Failed to serialize task result")?;
    let updated = conn.execute(
        r#"
        UPDATE tasks
        SET status = 'completed', completed_at = ?1, result = ?2
        WHERE id = ?3 AND status IN ('pending', 'in_progress')
        "#,
        params![now, result_json, id],
    )?;
    Ok(updated == 1)
}

/// Terminal failure, same guard as `complete`.
pub fn fail(conn: &Connection, id: &str, error: &FailureReport, now: i64) -> Result<bool> {
    let error_json = serde_json::to_string(error).context("Failed to serialize task error")?;
    let updated = conn.execute(
        r#"
        UPDATE tasks
        SET status = 'failed', failed_at = ?1, error = ?2
        WHERE id = ?3 AND status IN ('pending', 'in_progress')
        "#,
        params![now, error_json, id],
    )?;
    Ok(updated == 1)
}

/// Open tasks created before `cutoff` (stale-task sweep candidates).
pub fn list_stale_open(conn: &Connection, cutoff: i64) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tasks
         WHERE status IN ('pending', 'in_progress') AND created_at < ?1
         ORDER BY created_at ASC",
        COLUMNS
    ))?;
    let tasks = stmt
        .query_map(params![cutoff], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list stale open tasks")?;
    Ok(tasks)
}

/// All open tasks for one account (operator stuck-task reset scope).
pub fn list_open_for_account(conn: &Connection, account_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tasks
         WHERE account_id = ?1 AND status IN ('pending', 'in_progress')
         ORDER BY created_at ASC",
        COLUMNS
    ))?;
    let tasks = stmt
        .query_map(params![account_id], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list open tasks for account: {}", account_id))?;
    Ok(tasks)
}

/// Delete terminal tasks older than `cutoff`. Returns rows removed.
pub fn cleanup_terminal_before(conn: &Connection, cutoff: i64) -> Result<usize> {
    let removed = conn
        .execute(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed')
              AND COALESCE(completed_at, failed_at, created_at) < ?1
            "#,
            params![cutoff],
        )
        .context("Failed to clean up old terminal tasks")?;
    Ok(removed)
}
