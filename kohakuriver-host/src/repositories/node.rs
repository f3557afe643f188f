use crate::repositories::sqlite::SqliteDb;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kohakuriver_models::cluster::{GpuStats, NumaNode, VfioGpu};
use sqlx::{FromRow, Row, SqlitePool, sqlite::SqliteRow, types::Json};
use strum::{Display, EnumString};
use thiserror::Error;

/// Whether a node is currently heartbeating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// One runner as persisted on the host. Created on first registration,
/// refreshed by every heartbeat, never deleted automatically.
#[derive(Clone, Debug)]
pub struct NodeModel {
    pub hostname: String,
    pub url: String,
    pub status: NodeStatus,
    pub total_cores: u32,
    pub total_ram_bytes: u64,
    pub numa_topology: Option<Vec<NumaNode>>,
    pub gpu_info: Vec<GpuStats>,
    pub vm_capable: bool,
    pub vfio_gpus: Option<Vec<VfioGpu>>,
    pub runner_version: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for NodeModel {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let numa_topology: Option<Json<Vec<NumaNode>>> = row.try_get("numa_topology")?;
        let gpu_info: Json<Vec<GpuStats>> = row.try_get("gpu_info")?;
        let vfio_gpus: Option<Json<Vec<VfioGpu>>> = row.try_get("vfio_gpus")?;
        Ok(Self {
            hostname: row.try_get("hostname")?,
            url: row.try_get("url")?,
            status: status
                .parse()
                .map_err(|e| sqlx::Error::ColumnDecode { index: "status".into(), source: Box::new(e) })?,
            total_cores: row.try_get::<i64, _>("total_cores")? as u32,
            total_ram_bytes: row.try_get::<i64, _>("total_ram_bytes")? as u64,
            numa_topology: numa_topology.map(|v| v.0),
            gpu_info: gpu_info.0,
            vm_capable: row.try_get("vm_capable")?,
            vfio_gpus: vfio_gpus.map(|v| v.0),
            runner_version: row.try_get("runner_version")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            registered_at: row.try_get("registered_at")?,
        })
    }
}

/// Heartbeat-supplied fields applied to a node row.
#[derive(Clone, Debug)]
pub struct NodeHeartbeat {
    pub gpu_info: Vec<GpuStats>,
    pub vm_capable: bool,
    pub vfio_gpus: Option<Vec<VfioGpu>>,
    pub runner_version: Option<String>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NodeRepositoryError {
    #[error("node not found")]
    NodeNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Insert or refresh a node on registration; the node comes back online.
    async fn upsert(&self, node: NodeModel) -> Result<(), NodeRepositoryError>;

    async fn find(&self, hostname: &str) -> Result<NodeModel, NodeRepositoryError>;

    async fn list(&self) -> Result<Vec<NodeModel>, NodeRepositoryError>;

    async fn list_online(&self) -> Result<Vec<NodeModel>, NodeRepositoryError>;

    /// Apply a heartbeat. Fails with `NodeNotFound` for unknown hostnames
    /// so the runner knows to re-register.
    async fn apply_heartbeat(&self, hostname: &str, heartbeat: NodeHeartbeat) -> Result<(), NodeRepositoryError>;

    /// Mark every online node silent since `cutoff` as offline and return
    /// their hostnames.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, NodeRepositoryError>;
}

pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self { pool: db.into() }
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    async fn upsert(&self, node: NodeModel) -> Result<(), NodeRepositoryError> {
        let query = r"
INSERT INTO nodes (
    hostname, url, status, total_cores, total_ram_bytes, numa_topology, gpu_info,
    vm_capable, vfio_gpus, runner_version, last_heartbeat, registered_at
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (hostname) DO UPDATE SET
    url = excluded.url,
    status = excluded.status,
    total_cores = excluded.total_cores,
    total_ram_bytes = excluded.total_ram_bytes,
    numa_topology = excluded.numa_topology,
    gpu_info = excluded.gpu_info,
    vm_capable = excluded.vm_capable,
    vfio_gpus = excluded.vfio_gpus,
    runner_version = excluded.runner_version,
    last_heartbeat = excluded.last_heartbeat
";
        sqlx::query(query)
            .bind(&node.hostname)
            .bind(&node.url)
            .bind(node.status.to_string())
            .bind(node.total_cores as i64)
            .bind(node.total_ram_bytes as i64)
            .bind(node.numa_topology.map(Json))
            .bind(Json(node.gpu_info))
            .bind(node.vm_capable)
            .bind(node.vfio_gpus.map(Json))
            .bind(node.runner_version)
            .bind(node.last_heartbeat)
            .bind(node.registered_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, hostname: &str) -> Result<NodeModel, NodeRepositoryError> {
        let node: NodeModel = sqlx::query_as("SELECT * FROM nodes WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(NodeRepositoryError::NodeNotFound)?;
        Ok(node)
    }

    async fn list(&self) -> Result<Vec<NodeModel>, NodeRepositoryError> {
        Ok(sqlx::query_as("SELECT * FROM nodes ORDER BY hostname").fetch_all(&self.pool).await?)
    }

    async fn list_online(&self) -> Result<Vec<NodeModel>, NodeRepositoryError> {
        Ok(sqlx::query_as("SELECT * FROM nodes WHERE status = 'online' ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn apply_heartbeat(&self, hostname: &str, heartbeat: NodeHeartbeat) -> Result<(), NodeRepositoryError> {
        let query = r"
UPDATE nodes SET
    status = 'online',
    gpu_info = ?,
    vm_capable = ?,
    vfio_gpus = ?,
    runner_version = COALESCE(?, runner_version),
    last_heartbeat = ?
WHERE hostname = ?
";
        let result = sqlx::query(query)
            .bind(Json(heartbeat.gpu_info))
            .bind(heartbeat.vm_capable)
            .bind(heartbeat.vfio_gpus.map(Json))
            .bind(heartbeat.runner_version)
            .bind(heartbeat.seen_at)
            .bind(hostname)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(NodeRepositoryError::NodeNotFound);
        }
        Ok(())
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, NodeRepositoryError> {
        let query = r"
UPDATE nodes SET status = 'offline'
WHERE status = 'online' AND (last_heartbeat IS NULL OR last_heartbeat < ?)
RETURNING hostname
";
        let rows: Vec<(String,)> = sqlx::query_as(query).bind(cutoff).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(hostname,)| hostname).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn make_node(hostname: &str) -> NodeModel {
        NodeModel {
            hostname: hostname.into(),
            url: format!("http://{hostname}:8001"),
            status: NodeStatus::Online,
            total_cores: 8,
            total_ram_bytes: 32 * 1024 * 1024 * 1024,
            numa_topology: None,
            gpu_info: vec![],
            vm_capable: false,
            vfio_gpus: None,
            runner_version: Some("0.1.0".into()),
            last_heartbeat: Some(Utc::now()),
            registered_at: Utc::now(),
        }
    }

    async fn make_repo() -> SqliteNodeRepository {
        let db = SqliteDb::connect("sqlite://:memory:").await.expect("failed to create db");
        SqliteNodeRepository::new(db)
    }

    #[tokio::test]
    async fn register_and_find() {
        let repo = make_repo().await;
        repo.upsert(make_node("node1")).await.expect("failed to upsert");

        let found = repo.find("node1").await.expect("failed to find");
        assert_eq!(found.hostname, "node1");
        assert_eq!(found.status, NodeStatus::Online);

        // Re-registration refreshes the row instead of duplicating it.
        repo.upsert(NodeModel { total_cores: 16, ..make_node("node1") }).await.expect("failed to upsert");
        let found = repo.find("node1").await.expect("failed to find");
        assert_eq!(found.total_cores, 16);
        assert_eq!(repo.list().await.expect("list failed").len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_unknown_node() {
        let repo = make_repo().await;
        let heartbeat = NodeHeartbeat {
            gpu_info: vec![],
            vm_capable: false,
            vfio_gpus: None,
            runner_version: None,
            seen_at: Utc::now(),
        };
        let err = repo.apply_heartbeat("ghost", heartbeat).await.expect_err("heartbeat succeeded");
        assert!(matches!(err, NodeRepositoryError::NodeNotFound));
    }

    #[tokio::test]
    async fn stale_nodes_marked_offline() {
        let repo = make_repo().await;
        let stale = NodeModel { last_heartbeat: Some(Utc::now() - Duration::seconds(60)), ..make_node("stale") };
        repo.upsert(stale).await.unwrap();
        repo.upsert(make_node("fresh")).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(15);
        let offlined = repo.mark_stale_offline(cutoff).await.expect("query failed");
        assert_eq!(offlined, vec!["stale".to_string()]);
        assert_eq!(repo.find("stale").await.unwrap().status, NodeStatus::Offline);
        assert_eq!(repo.find("fresh").await.unwrap().status, NodeStatus::Online);
        assert_eq!(repo.list_online().await.unwrap().len(), 1);
    }
}
