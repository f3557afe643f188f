//! Startup reconciliation.
//!
//! After a runner restart, every persisted task record is checked against
//! live OS state: containers and VMs still running are re-adopted, dead
//! ones are reported to the host and dropped. A runner restart therefore
//! never orphans a workload the host still believes is running.

use crate::{
    clients::{docker::DockerClient, host::HostApiClient},
    overlay::RunnerOverlayManager,
    qemu::manager::VmManager,
    repositories::records::{RecordKind, TaskRecordRepository},
};
use chrono::Utc;
use kohakuriver_models::task::{TaskStatus, TaskStatusUpdate};
use std::sync::Arc;
use tracing::{info, warn};

pub struct StartupReconciler {
    pub docker: Arc<dyn DockerClient>,
    pub vms: Arc<VmManager>,
    pub overlay: Arc<RunnerOverlayManager>,
    pub records: Arc<dyn TaskRecordRepository>,
    pub host: Arc<dyn HostApiClient>,
}

impl StartupReconciler {
    pub async fn run(&self) {
        let records = match self.records.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Startup check: cannot list task records: {e}");
                return;
            }
        };
        info!("Startup check: {} persisted task records", records.len());

        for record in records {
            let task_id = record.task_id;
            let alive = match record.kind {
                RecordKind::Container => self.docker.is_running(&record.name).await,
                RecordKind::Vm => self.vms.recover(&record, &self.overlay).await,
            };
            if alive {
                info!("Task {task_id}: {} still alive, re-adopted", record.name);
                continue;
            }

            warn!("Task {task_id}: {} gone, reporting crash", record.name);
            let update = TaskStatusUpdate {
                task_id,
                status: TaskStatus::Failed,
                exit_code: None,
                message: Some("detected crashed workload during runner startup".into()),
                started_at: None,
                completed_at: Some(Utc::now()),
            };
            if let Err(e) = self.host.report_status(update).await {
                warn!("Task {task_id}: failed to report crash: {e}");
            }
            if let Err(e) = self.records.remove(task_id).await {
                warn!("Task {task_id}: failed to drop record: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::{docker::MockDockerClient, host::MockHostApiClient},
        qemu::manager::{VmManager, VmManagerArgs},
        repositories::records::{MockTaskRecordRepository, TaskRecord},
    };
    use mockall::predicate::eq;

    fn make_vms() -> Arc<VmManager> {
        Arc::new(VmManager::new(VmManagerArgs {
            images_dir: "/tmp/images".into(),
            instances_dir: "/tmp/instances".into(),
            dns_servers: vec![],
            shared_dir: "/tmp/shared".into(),
            local_temp_dir: "/tmp/local".into(),
        }))
    }

    #[tokio::test]
    async fn live_container_is_readopted() {
        let mut docker = MockDockerClient::new();
        docker.expect_is_running().with(eq("kohakuriver-task-1")).return_once(|_| true);
        let mut records = MockTaskRecordRepository::new();
        records
            .expect_list()
            .return_once(|| Ok(vec![TaskRecord::container(1, "kohakuriver-task-1".into(), 1, vec![], None)]));
        records.expect_remove().never();
        let mut host = MockHostApiClient::new();
        host.expect_report_status().never();

        let reconciler = StartupReconciler {
            docker: Arc::new(docker),
            vms: make_vms(),
            overlay: Arc::new(RunnerOverlayManager::new(100, 4789, 1450)),
            records: Arc::new(records),
            host: Arc::new(host),
        };
        reconciler.run().await;
    }

    #[tokio::test]
    async fn dead_container_is_reported_and_dropped() {
        let mut docker = MockDockerClient::new();
        docker.expect_is_running().return_once(|_| false);
        let mut records = MockTaskRecordRepository::new();
        records
            .expect_list()
            .return_once(|| Ok(vec![TaskRecord::container(2, "kohakuriver-task-2".into(), 1, vec![], None)]));
        records.expect_remove().with(eq(2)).once().returning(|_| Ok(true));
        let mut host = MockHostApiClient::new();
        host.expect_report_status()
            .withf(|update| {
                update.task_id == 2
                    && update.status == TaskStatus::Failed
                    && update.message.as_deref().is_some_and(|m| m.contains("crashed"))
            })
            .once()
            .returning(|_| Ok(()));

        let reconciler = StartupReconciler {
            docker: Arc::new(docker),
            vms: make_vms(),
            overlay: Arc::new(RunnerOverlayManager::new(100, 4789, 1450)),
            records: Arc::new(records),
            host: Arc::new(host),
        };
        reconciler.run().await;
    }
}
