//! Request / close / report-idle against the sqlite store.

use crate::error::{DatabaseError, TaskStoreError};
use crate::types::{JobId, Task, TaskParams};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::FromRow;
use std::time::Duration;

use super::{
    CaptureTaskRecord, CloseTask, NewCaptureTask, RequestTaskResult, SqliteTaskStore, TaskStore,
    task_state,
};

/// Pause between busy retries inside one request
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(FromRow)]
struct ClaimedRow {
    job: i64,
    step: i32,
    step_tool: String,
    dataset: String,
    params: String,
}

/// How a sqlite failure maps onto the store protocol
#[derive(Debug, PartialEq, Eq)]
enum Contention {
    /// SQLITE_BUSY or pool timeout; worth retrying
    Busy,
    /// SQLITE_LOCKED; this call lost a lock conflict
    Locked,
    /// Anything else
    None,
}

fn contention(err: &sqlx::Error) -> Contention {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("5") => Contention::Busy,
            Some("6") => Contention::Locked,
            _ if db.message().contains("database is locked") => Contention::Busy,
            _ => Contention::None,
        },
        sqlx::Error::PoolTimedOut => Contention::Busy,
        _ => Contention::None,
    }
}

impl SqliteTaskStore {
    /// Insert a pending task
    pub async fn enqueue_task(&self, task: &NewCaptureTask) -> Result<()> {
        let params: Vec<(&str, &str)> = task.params.iter().collect();
        let params = serde_json::to_string(&params)?;

        sqlx::query(
            r#"
            INSERT INTO capture_tasks (job, step, step_tool, dataset, params, priority, state)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.job.get())
        .bind(task.step)
        .bind(&task.step_tool)
        .bind(&task.dataset)
        .bind(params)
        .bind(task.priority)
        .bind(task_state::PENDING)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert task {}/{}: {}",
                task.job, task.step, e
            )))
        })?;

        Ok(())
    }

    /// Fetch one task record
    pub async fn get_task(&self, job: JobId, step: i32) -> Result<Option<CaptureTaskRecord>> {
        let row = sqlx::query_as::<_, CaptureTaskRecord>(
            r#"
            SELECT job, step, step_tool, dataset, state, processor,
                   closeout_code, closeout_msg, eval_code, eval_msg
            FROM capture_tasks
            WHERE job = ? AND step = ?
            "#,
        )
        .bind(job.get())
        .bind(step)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get task {}/{}: {}",
                job, step, e
            )))
        })?;

        Ok(row)
    }

    async fn claim_next(&self, manager: &str) -> std::result::Result<Option<ClaimedRow>, sqlx::Error> {
        sqlx::query_as::<_, ClaimedRow>(
            r#"
            UPDATE capture_tasks
            SET state = ?, processor = ?, assigned_at = ?
            WHERE rowid = (
                SELECT rowid FROM capture_tasks
                WHERE state = ?
                ORDER BY priority DESC, job ASC, step ASC
                LIMIT 1
            )
            RETURNING job, step, step_tool, dataset, params
            "#,
        )
        .bind(task_state::ASSIGNED)
        .bind(manager)
        .bind(chrono::Utc::now().timestamp())
        .bind(task_state::PENDING)
        .fetch_optional(&self.pool)
        .await
    }

    async fn record_activity(&self, manager: &str, version: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO manager_activity (manager, version, last_request_at)
            VALUES (?, ?, ?)
            ON CONFLICT(manager) DO UPDATE SET
                version = excluded.version,
                last_request_at = excluded.last_request_at
            "#,
        )
        .bind(manager)
        .bind(version)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::debug!(error = %e, manager, "Failed to record manager activity");
        }
    }
}

/// Turn a claimed row into a task; bad parameters become a ResultError
/// that names the job and step so the controller can fail the task.
fn claimed_to_result(row: ClaimedRow) -> RequestTaskResult {
    let pairs: Vec<(String, String)> = match serde_json::from_str(&row.params) {
        Ok(pairs) => pairs,
        Err(e) => {
            return RequestTaskResult::ResultError {
                message: format!(
                    "Unable to parse task parameters for job {} step {}: {}",
                    row.job, row.step, e
                ),
                job: Some(JobId(row.job)),
                step: Some(row.step),
            };
        }
    };

    let mut params: TaskParams = pairs.into_iter().collect();
    params.set("Job", row.job.to_string());
    params.set("Step", row.step.to_string());
    params.set("StepTool", row.step_tool);
    params.set("Dataset", row.dataset);

    RequestTaskResult::TaskFound(Task::assigned(row.job, row.step, params))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn request_task(&self, manager: &str, version: &str) -> RequestTaskResult {
        self.record_activity(manager, version).await;

        let mut busy_attempts = 0;
        loop {
            match self.claim_next(manager).await {
                Ok(Some(row)) => {
                    tracing::debug!(job = row.job, step = row.step, manager, "Task assigned");
                    return claimed_to_result(row);
                }
                Ok(None) => return RequestTaskResult::NoTaskFound,
                Err(e) => match contention(&e) {
                    Contention::Locked => {
                        tracing::warn!(error = %e, "request_task lost a lock conflict");
                        return RequestTaskResult::Deadlock;
                    }
                    Contention::Busy if busy_attempts < self.busy_retries => {
                        busy_attempts += 1;
                        tracing::debug!(attempt = busy_attempts, "Task store busy, retrying");
                        tokio::time::sleep(BUSY_RETRY_DELAY).await;
                    }
                    Contention::Busy => return RequestTaskResult::TooManyRetries,
                    Contention::None => {
                        return RequestTaskResult::ResultError {
                            message: format!("request_task failed: {}", e),
                            job: None,
                            step: None,
                        };
                    }
                },
            }
        }
    }

    async fn close_task(&self, close: &CloseTask) -> Result<()> {
        let assignment = close.assignment;
        let result = sqlx::query(
            r#"
            UPDATE capture_tasks
            SET state = ?, closeout_code = ?, closeout_msg = ?,
                eval_code = ?, eval_msg = ?, completed_at = ?
            WHERE job = ? AND step = ? AND state = ?
            "#,
        )
        .bind(task_state::CLOSED)
        .bind(close.closeout.to_i32())
        .bind(&close.message)
        .bind(close.eval_code.to_i32())
        .bind(&close.eval_message)
        .bind(chrono::Utc::now().timestamp())
        .bind(assignment.job.get())
        .bind(assignment.step)
        .bind(task_state::ASSIGNED)
        .execute(&self.pool)
        .await
        .map_err(|e| match contention(&e) {
            Contention::Locked | Contention::Busy => Error::TaskStore(TaskStoreError::Deadlock {
                procedure: "close_task",
            }),
            Contention::None => Error::TaskStore(TaskStoreError::CallFailed {
                procedure: "close_task",
                code: -1,
                message: e.to_string(),
            }),
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::TaskStore(TaskStoreError::NotAssigned {
                job: assignment.job.get(),
                step: assignment.step,
            }));
        }

        Ok(())
    }

    async fn report_idle(&self, manager: &str) -> Result<()> {
        let released = sqlx::query(
            "UPDATE capture_tasks SET state = ?, processor = NULL, assigned_at = NULL WHERE processor = ? AND state = ?",
        )
        .bind(task_state::PENDING)
        .bind(manager)
        .bind(task_state::ASSIGNED)
        .execute(&self.pool)
        .await
        .map_err(|e| match contention(&e) {
            Contention::Locked | Contention::Busy => Error::TaskStore(TaskStoreError::Deadlock {
                procedure: "report_idle",
            }),
            Contention::None => Error::TaskStore(TaskStoreError::CallFailed {
                procedure: "report_idle",
                code: -1,
                message: e.to_string(),
            }),
        })?;

        if released.rows_affected() > 0 {
            tracing::warn!(
                manager,
                released = released.rows_affected(),
                "Released tasks the store had assigned to an idle manager"
            );
        }

        sqlx::query(
            r#"
            INSERT INTO manager_activity (manager, idle_reported_at)
            VALUES (?, ?)
            ON CONFLICT(manager) DO UPDATE SET idle_reported_at = excluded.idle_reported_at
            "#,
        )
        .bind(manager)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record idle report: {}",
                e
            )))
        })?;

        Ok(())
    }
}
