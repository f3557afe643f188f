use crate::repositories::sqlite::SqliteDb;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kohakuriver_models::{
    task::{TaskStatus, TaskSummary, TaskType},
    vps::VpsBackend,
};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow, types::Json};
use std::collections::HashMap;
use thiserror::Error;

/// One task row. Rows are never deleted; terminal rows form the audit
/// trail.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskModel {
    pub task_id: i64,
    pub task_type: TaskType,
    pub command: Option<String>,
    pub arguments: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub required_cores: u32,
    pub required_memory_bytes: Option<u64>,
    pub required_gpus: Option<Vec<u32>>,
    pub target_numa_node_id: Option<u32>,
    pub container_name: Option<String>,
    pub registry_image: Option<String>,
    pub privileged: bool,
    pub additional_mounts: Vec<String>,
    pub working_dir: Option<String>,
    pub vps_backend: Option<VpsBackend>,
    pub ssh_port: Option<u16>,
    pub vm_image: Option<String>,
    pub vm_disk_size: Option<String>,
    pub memory_mb: Option<u32>,
    pub vm_ip: Option<String>,
    pub assigned_node: Option<String>,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn decode_error<E>(column: &str, source: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::ColumnDecode { index: column.into(), source: Box::new(source) }
}

impl FromRow<'_, SqliteRow> for TaskModel {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let task_type: String = row.try_get("task_type")?;
        let status: String = row.try_get("status")?;
        let vps_backend: Option<String> = row.try_get("vps_backend")?;
        let arguments: Json<Vec<String>> = row.try_get("arguments")?;
        let env_vars: Json<HashMap<String, String>> = row.try_get("env_vars")?;
        let required_gpus: Option<Json<Vec<u32>>> = row.try_get("required_gpus")?;
        let additional_mounts: Json<Vec<String>> = row.try_get("additional_mounts")?;
        Ok(Self {
            task_id: row.try_get("task_id")?,
            task_type: task_type.parse().map_err(|e| decode_error("task_type", e))?,
            command: row.try_get("command")?,
            arguments: arguments.0,
            env_vars: env_vars.0,
            required_cores: row.try_get::<i64, _>("required_cores")? as u32,
            required_memory_bytes: row.try_get::<Option<i64>, _>("required_memory_bytes")?.map(|v| v as u64),
            required_gpus: required_gpus.map(|v| v.0),
            target_numa_node_id: row.try_get::<Option<i64>, _>("target_numa_node_id")?.map(|v| v as u32),
            container_name: row.try_get("container_name")?,
            registry_image: row.try_get("registry_image")?,
            privileged: row.try_get("privileged")?,
            additional_mounts: additional_mounts.0,
            working_dir: row.try_get("working_dir")?,
            vps_backend: vps_backend
                .map(|v| v.parse().map_err(|e| decode_error("vps_backend", e)))
                .transpose()?,
            ssh_port: row.try_get::<Option<i64>, _>("ssh_port")?.map(|v| v as u16),
            vm_image: row.try_get("vm_image")?,
            vm_disk_size: row.try_get("vm_disk_size")?,
            memory_mb: row.try_get::<Option<i64>, _>("memory_mb")?.map(|v| v as u32),
            vm_ip: row.try_get("vm_ip")?,
            assigned_node: row.try_get("assigned_node")?,
            status: status.parse().map_err(|e| decode_error("status", e))?,
            exit_code: row.try_get("exit_code")?,
            error_message: row.try_get("error_message")?,
            submitted_at: row.try_get("submitted_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl From<TaskModel> for TaskSummary {
    fn from(task: TaskModel) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type,
            status: task.status,
            command: task.command,
            required_cores: task.required_cores,
            required_memory_bytes: task.required_memory_bytes,
            required_gpus: task.required_gpus,
            target_numa_node_id: task.target_numa_node_id,
            container_name: task.container_name,
            registry_image: task.registry_image,
            assigned_node: task.assigned_node,
            exit_code: task.exit_code,
            error_message: task.error_message,
            ssh_port: task.ssh_port,
            vm_ip: task.vm_ip,
            submitted_at: task.submitted_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

/// Fields of a status update applied to a row.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub fn new(status: TaskStatus) -> Self {
        Self { status, exit_code: None, error_message: None, started_at: None, completed_at: None }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub node: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Error)]
pub enum TaskRepositoryError {
    #[error("task not found")]
    TaskNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new task row.
    async fn create(&self, task: TaskModel) -> Result<(), TaskRepositoryError>;

    async fn find(&self, task_id: i64) -> Result<TaskModel, TaskRepositoryError>;

    async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskModel>, TaskRepositoryError>;

    /// All tasks holding resources anywhere in the cluster.
    async fn active(&self) -> Result<Vec<TaskModel>, TaskRepositoryError>;

    /// Tasks holding resources on a node (assigning, running or paused).
    async fn active_on_node(&self, hostname: &str) -> Result<Vec<TaskModel>, TaskRepositoryError>;

    /// SSH ports of all VPS rows in active states, for uniqueness.
    async fn active_ssh_ports(&self) -> Result<Vec<u16>, TaskRepositoryError>;

    /// Apply a status change unless the row is already terminal. Returns
    /// false when the row was terminal and the change was dropped. This is
    /// the single write path for task state, keyed by primary key.
    async fn apply_status(&self, task_id: i64, change: StatusChange) -> Result<bool, TaskRepositoryError>;

    /// Record the VM IP reported by a runner.
    async fn set_vm_ip(&self, task_id: i64, vm_ip: &str) -> Result<(), TaskRepositoryError>;
}

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self { pool: db.into() }
    }
}

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'killed', 'killed_oom', 'stopped', 'lost')";

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: TaskModel) -> Result<(), TaskRepositoryError> {
        let query = r"
INSERT INTO tasks (
    task_id, task_type, command, arguments, env_vars, required_cores, required_memory_bytes,
    required_gpus, target_numa_node_id, container_name, registry_image, privileged,
    additional_mounts, working_dir, vps_backend, ssh_port, vm_image, vm_disk_size, memory_mb,
    vm_ip, assigned_node, status, exit_code, error_message, submitted_at, started_at, completed_at
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";
        sqlx::query(query)
            .bind(task.task_id)
            .bind(task.task_type.to_string())
            .bind(task.command)
            .bind(Json(task.arguments))
            .bind(Json(task.env_vars))
            .bind(task.required_cores as i64)
            .bind(task.required_memory_bytes.map(|v| v as i64))
            .bind(task.required_gpus.map(Json))
            .bind(task.target_numa_node_id.map(i64::from))
            .bind(task.container_name)
            .bind(task.registry_image)
            .bind(task.privileged)
            .bind(Json(task.additional_mounts))
            .bind(task.working_dir)
            .bind(task.vps_backend.map(|v| v.to_string()))
            .bind(task.ssh_port.map(i64::from))
            .bind(task.vm_image)
            .bind(task.vm_disk_size)
            .bind(task.memory_mb.map(i64::from))
            .bind(task.vm_ip)
            .bind(task.assigned_node)
            .bind(task.status.to_string())
            .bind(task.exit_code)
            .bind(task.error_message)
            .bind(task.submitted_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, task_id: i64) -> Result<TaskModel, TaskRepositoryError> {
        let query = "SELECT * FROM tasks WHERE task_id = ?";
        let task: TaskModel = sqlx::query_as(query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TaskRepositoryError::TaskNotFound)?;
        Ok(task)
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<TaskModel>, TaskRepositoryError> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }
        if filter.node.is_some() {
            query.push_str(" AND assigned_node = ?");
        }
        query.push_str(" ORDER BY task_id DESC");
        if filter.limit.is_some() {
            query.push_str(" LIMIT ?");
        }
        let mut q = sqlx::query_as(&query);
        if let Some(status) = filter.status {
            q = q.bind(status.to_string());
        }
        if let Some(node) = filter.node {
            q = q.bind(node);
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit as i64);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn active(&self) -> Result<Vec<TaskModel>, TaskRepositoryError> {
        let query = format!("SELECT * FROM tasks WHERE status NOT IN {TERMINAL_STATUSES}");
        Ok(sqlx::query_as(&query).fetch_all(&self.pool).await?)
    }

    async fn active_on_node(&self, hostname: &str) -> Result<Vec<TaskModel>, TaskRepositoryError> {
        let query = format!("SELECT * FROM tasks WHERE assigned_node = ? AND status NOT IN {TERMINAL_STATUSES}");
        Ok(sqlx::query_as(&query).bind(hostname).fetch_all(&self.pool).await?)
    }

    async fn active_ssh_ports(&self) -> Result<Vec<u16>, TaskRepositoryError> {
        let query = format!(
            "SELECT ssh_port FROM tasks
             WHERE task_type = 'vps' AND ssh_port IS NOT NULL AND status NOT IN {TERMINAL_STATUSES}"
        );
        let rows: Vec<(i64,)> = sqlx::query_as(&query).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(port,)| port as u16).collect())
    }

    async fn apply_status(&self, task_id: i64, change: StatusChange) -> Result<bool, TaskRepositoryError> {
        // Terminal statuses are absorbing: the WHERE clause refuses to
        // touch rows that already reached one.
        let query = format!(
            "UPDATE tasks SET
                 status = ?,
                 exit_code = COALESCE(?, exit_code),
                 error_message = COALESCE(?, error_message),
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at)
             WHERE task_id = ? AND status NOT IN {TERMINAL_STATUSES}"
        );
        let result = sqlx::query(&query)
            .bind(change.status.to_string())
            .bind(change.exit_code)
            .bind(change.error_message)
            .bind(change.started_at)
            .bind(change.completed_at)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_vm_ip(&self, task_id: i64, vm_ip: &str) -> Result<(), TaskRepositoryError> {
        sqlx::query("UPDATE tasks SET vm_ip = ? WHERE task_id = ?")
            .bind(vm_ip)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_task(task_id: i64) -> TaskModel {
        TaskModel {
            task_id,
            task_type: TaskType::Command,
            command: Some("echo hi".into()),
            arguments: vec!["-n".into()],
            env_vars: HashMap::from([("FOO".into(), "bar".into())]),
            required_cores: 1,
            required_memory_bytes: None,
            required_gpus: None,
            target_numa_node_id: None,
            container_name: Some("envA".into()),
            registry_image: None,
            privileged: false,
            additional_mounts: vec![],
            working_dir: None,
            vps_backend: None,
            ssh_port: None,
            vm_image: None,
            vm_disk_size: None,
            memory_mb: None,
            vm_ip: None,
            assigned_node: Some("node1".into()),
            status: TaskStatus::Assigning,
            exit_code: None,
            error_message: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    async fn make_repo() -> SqliteTaskRepository {
        let db = SqliteDb::connect("sqlite://:memory:").await.expect("failed to create db");
        SqliteTaskRepository::new(db)
    }

    #[tokio::test]
    async fn create_and_find() {
        let repo = make_repo().await;
        let task = make_task(1);
        repo.create(task.clone()).await.expect("failed to insert");

        let found = repo.find(1).await.expect("failed to find");
        assert_eq!(found.task_id, task.task_id);
        assert_eq!(found.command, task.command);
        assert_eq!(found.env_vars, task.env_vars);
        assert_eq!(found.status, TaskStatus::Assigning);
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let repo = make_repo().await;
        repo.create(make_task(1)).await.expect("failed to insert");
        repo.create(make_task(1)).await.expect_err("duplicate insert succeeded");
    }

    #[tokio::test]
    async fn status_updates_until_terminal() {
        let repo = make_repo().await;
        repo.create(make_task(7)).await.expect("failed to insert");

        let applied = repo
            .apply_status(7, StatusChange { started_at: Some(Utc::now()), ..StatusChange::new(TaskStatus::Running) })
            .await
            .expect("update failed");
        assert!(applied);

        let applied = repo
            .apply_status(
                7,
                StatusChange {
                    exit_code: Some(0),
                    completed_at: Some(Utc::now()),
                    ..StatusChange::new(TaskStatus::Completed)
                },
            )
            .await
            .expect("update failed");
        assert!(applied);

        // Terminal is absorbing: no further transition is persisted.
        let applied = repo
            .apply_status(7, StatusChange::new(TaskStatus::Failed))
            .await
            .expect("update failed");
        assert!(!applied);
        let found = repo.find(7).await.expect("failed to find");
        assert_eq!(found.status, TaskStatus::Completed);
        assert_eq!(found.exit_code, Some(0));
    }

    #[tokio::test]
    async fn list_filters() {
        let repo = make_repo().await;
        repo.create(make_task(1)).await.unwrap();
        repo.create(TaskModel { assigned_node: Some("node2".into()), ..make_task(2) }).await.unwrap();
        repo.apply_status(1, StatusChange::new(TaskStatus::Running)).await.unwrap();

        let running = repo
            .list(TaskFilter { status: Some(TaskStatus::Running), ..Default::default() })
            .await
            .expect("list failed");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, 1);

        let on_node2 = repo
            .list(TaskFilter { node: Some("node2".into()), ..Default::default() })
            .await
            .expect("list failed");
        assert_eq!(on_node2.len(), 1);
        assert_eq!(on_node2[0].task_id, 2);
    }

    #[tokio::test]
    async fn active_ssh_ports_excludes_terminal() {
        let repo = make_repo().await;
        let vps = TaskModel {
            task_type: TaskType::Vps,
            vps_backend: Some(VpsBackend::Docker),
            ssh_port: Some(2222),
            ..make_task(1)
        };
        repo.create(vps).await.unwrap();
        let stopped = TaskModel {
            task_type: TaskType::Vps,
            vps_backend: Some(VpsBackend::Docker),
            ssh_port: Some(2223),
            status: TaskStatus::Stopped,
            ..make_task(2)
        };
        repo.create(stopped).await.unwrap();

        assert_eq!(repo.active_ssh_ports().await.expect("query failed"), vec![2222]);
    }

    #[tokio::test]
    async fn active_on_node() {
        let repo = make_repo().await;
        repo.create(make_task(1)).await.unwrap();
        repo.create(TaskModel { status: TaskStatus::Completed, ..make_task(2) }).await.unwrap();

        let active = repo.active_on_node("node1").await.expect("query failed");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, 1);
    }
}
