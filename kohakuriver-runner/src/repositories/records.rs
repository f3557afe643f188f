//! The runner's durable task ledger.
//!
//! One row per workload this runner is executing, written immediately
//! before the container or VM is created. Startup reconciliation walks
//! this table to re-adopt live workloads and report dead ones, so a
//! runner crash never orphans anything the host still believes is
//! running.

use crate::repositories::sqlite::SqliteDb;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow, types::Json};
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
    /// A Docker container (batch task or docker VPS).
    Container,

    /// A QEMU VM.
    Vm,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub task_id: i64,
    pub kind: RecordKind,
    /// Container name or VM name.
    pub name: String,
    pub allocated_cores: u32,
    pub allocated_gpus: Vec<u32>,
    pub numa_node: Option<u32>,
    pub vm_ip: Option<String>,
    pub tap_device: Option<String>,
    pub mac_address: Option<String>,
    pub gpu_pci_addresses: Vec<String>,
    pub ssh_port: Option<u16>,
    pub network_mode: Option<String>,
    pub bridge_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A plain container record; VM fields stay empty.
    pub fn container(task_id: i64, name: String, cores: u32, gpus: Vec<u32>, numa_node: Option<u32>) -> Self {
        Self {
            task_id,
            kind: RecordKind::Container,
            name,
            allocated_cores: cores,
            allocated_gpus: gpus,
            numa_node,
            vm_ip: None,
            tap_device: None,
            mac_address: None,
            gpu_pci_addresses: vec![],
            ssh_port: None,
            network_mode: None,
            bridge_name: None,
            created_at: Utc::now(),
        }
    }
}

impl FromRow<'_, SqliteRow> for TaskRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let allocated_gpus: Json<Vec<u32>> = row.try_get("allocated_gpus")?;
        let gpu_pci_addresses: Json<Vec<String>> = row.try_get("gpu_pci_addresses")?;
        Ok(Self {
            task_id: row.try_get("task_id")?,
            kind: kind
                .parse()
                .map_err(|e| sqlx::Error::ColumnDecode { index: "kind".into(), source: Box::new(e) })?,
            name: row.try_get("name")?,
            allocated_cores: row.try_get::<i64, _>("allocated_cores")? as u32,
            allocated_gpus: allocated_gpus.0,
            numa_node: row.try_get::<Option<i64>, _>("numa_node")?.map(|v| v as u32),
            vm_ip: row.try_get("vm_ip")?,
            tap_device: row.try_get("tap_device")?,
            mac_address: row.try_get("mac_address")?,
            gpu_pci_addresses: gpu_pci_addresses.0,
            ssh_port: row.try_get::<Option<i64>, _>("ssh_port")?.map(|v| v as u16),
            network_mode: row.try_get("network_mode")?,
            bridge_name: row.try_get("bridge_name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Error)]
pub enum RecordRepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRecordRepository: Send + Sync {
    async fn insert(&self, record: TaskRecord) -> Result<(), RecordRepositoryError>;

    async fn get(&self, task_id: i64) -> Result<Option<TaskRecord>, RecordRepositoryError>;

    /// Remove a record. Returns whether it existed; the executor uses
    /// this to tell an external kill from normal completion.
    async fn remove(&self, task_id: i64) -> Result<bool, RecordRepositoryError>;

    async fn list(&self) -> Result<Vec<TaskRecord>, RecordRepositoryError>;

    async fn running_task_ids(&self) -> Result<Vec<i64>, RecordRepositoryError>;
}

pub struct SqliteTaskRecordRepository {
    pool: SqlitePool,
}

impl SqliteTaskRecordRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self { pool: db.into() }
    }
}

#[async_trait]
impl TaskRecordRepository for SqliteTaskRecordRepository {
    async fn insert(&self, record: TaskRecord) -> Result<(), RecordRepositoryError> {
        let query = r"
INSERT INTO task_records (
    task_id, kind, name, allocated_cores, allocated_gpus, numa_node, vm_ip, tap_device,
    mac_address, gpu_pci_addresses, ssh_port, network_mode, bridge_name, created_at
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (task_id) DO UPDATE SET
    kind = excluded.kind,
    name = excluded.name,
    allocated_cores = excluded.allocated_cores,
    allocated_gpus = excluded.allocated_gpus,
    numa_node = excluded.numa_node,
    vm_ip = excluded.vm_ip,
    tap_device = excluded.tap_device,
    mac_address = excluded.mac_address,
    gpu_pci_addresses = excluded.gpu_pci_addresses,
    ssh_port = excluded.ssh_port,
    network_mode = excluded.network_mode,
    bridge_name = excluded.bridge_name
";
        sqlx::query(query)
            .bind(record.task_id)
            .bind(record.kind.to_string())
            .bind(record.name)
            .bind(record.allocated_cores as i64)
            .bind(Json(record.allocated_gpus))
            .bind(record.numa_node.map(i64::from))
            .bind(record.vm_ip)
            .bind(record.tap_device)
            .bind(record.mac_address)
            .bind(Json(record.gpu_pci_addresses))
            .bind(record.ssh_port.map(i64::from))
            .bind(record.network_mode)
            .bind(record.bridge_name)
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, task_id: i64) -> Result<Option<TaskRecord>, RecordRepositoryError> {
        Ok(sqlx::query_as("SELECT * FROM task_records WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn remove(&self, task_id: i64) -> Result<bool, RecordRepositoryError> {
        let result = sqlx::query("DELETE FROM task_records WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, RecordRepositoryError> {
        Ok(sqlx::query_as("SELECT * FROM task_records ORDER BY task_id").fetch_all(&self.pool).await?)
    }

    async fn running_task_ids(&self) -> Result<Vec<i64>, RecordRepositoryError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT task_id FROM task_records ORDER BY task_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(task_id,)| task_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_repo() -> SqliteTaskRecordRepository {
        let db = SqliteDb::connect("sqlite://:memory:").await.expect("failed to create db");
        SqliteTaskRecordRepository::new(db)
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let repo = make_repo().await;
        let record = TaskRecord::container(1, "kohakuriver-task-1".into(), 2, vec![0], Some(1));
        repo.insert(record.clone()).await.expect("failed to insert");

        let found = repo.get(1).await.expect("query failed").expect("record missing");
        assert_eq!(found.name, "kohakuriver-task-1");
        assert_eq!(found.allocated_gpus, vec![0]);
        assert_eq!(found.kind, RecordKind::Container);

        assert!(repo.remove(1).await.expect("remove failed"));
        // Second removal reports the record was already gone.
        assert!(!repo.remove(1).await.expect("remove failed"));
        assert!(repo.get(1).await.expect("query failed").is_none());
    }

    #[tokio::test]
    async fn vm_record_roundtrip() {
        let repo = make_repo().await;
        let record = TaskRecord {
            kind: RecordKind::Vm,
            name: "vm-2".into(),
            vm_ip: Some("10.128.64.200".into()),
            tap_device: Some("tap-vm-2".into()),
            mac_address: Some("52:54:00:00:00:02".into()),
            gpu_pci_addresses: vec!["0000:01:00.0".into()],
            ssh_port: Some(2222),
            network_mode: Some("overlay".into()),
            bridge_name: Some("kohaku-overlay".into()),
            ..TaskRecord::container(2, String::new(), 4, vec![], None)
        };
        repo.insert(record.clone()).await.expect("failed to insert");
        let found = repo.get(2).await.expect("query failed").expect("record missing");
        assert_eq!(found.kind, RecordKind::Vm);
        assert_eq!(found.vm_ip.as_deref(), Some("10.128.64.200"));
        assert_eq!(found.gpu_pci_addresses, vec!["0000:01:00.0"]);
    }

    #[tokio::test]
    async fn running_ids_sorted() {
        let repo = make_repo().await;
        for task_id in [3, 1, 2] {
            let record = TaskRecord::container(task_id, format!("kohakuriver-task-{task_id}"), 1, vec![], None);
            repo.insert(record).await.unwrap();
        }
        assert_eq!(repo.running_task_ids().await.expect("query failed"), vec![1, 2, 3]);
    }
}
