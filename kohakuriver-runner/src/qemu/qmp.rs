//! QMP access to running VMs over their per-VM unix sockets.
//!
//! One request-response at a time per socket; each call opens a fresh
//! connection, negotiates, executes and tears down.

use qapi::{
    Command as QapiCommandTrait, ExecuteError,
    futures::{QapiService, QapiStream, QmpStreamNegotiation, QmpStreamTokio},
    qmp::{QmpCommand, quit, system_powerdown, system_reset},
};
use std::{io, path::Path};
use thiserror::Error;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::UnixStream,
    task::JoinHandle,
};
use tracing::debug;

type QmpReadStreamHalf = QmpStreamTokio<ReadHalf<UnixStream>>;
type QmpWriteStreamHalf = QmpStreamTokio<WriteHalf<UnixStream>>;
type NegotiatedQmpStream = QapiStream<QmpReadStreamHalf, QmpWriteStreamHalf>;
type QmpCommandService = QapiService<QmpWriteStreamHalf>;
type QmpDriverTaskHandle = JoinHandle<()>;

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("QMP socket unreachable: {0}")]
    Unreachable(String),

    #[error("QMP command failed: {0}")]
    Command(String),
}

pub struct QmpClient;

impl QmpClient {
    async fn connect(socket_path: &Path) -> Result<(QmpCommandService, QmpDriverTaskHandle), QmpError> {
        debug!("Connecting to QMP socket at {}", socket_path.display());
        let pre_negotiation: QmpStreamNegotiation<QmpReadStreamHalf, QmpWriteStreamHalf> =
            QmpStreamTokio::open_uds(socket_path).await.map_err(|e| {
                QmpError::Unreachable(format!("cannot connect to {}: {e}", socket_path.display()))
            })?;
        let negotiated: NegotiatedQmpStream = pre_negotiation.negotiate().await.map_err(|e: io::Error| {
            QmpError::Unreachable(format!("negotiation failed on {}: {e}", socket_path.display()))
        })?;
        Ok(negotiated.spawn_tokio())
    }

    async fn execute<C>(socket_path: &Path, command: C) -> Result<<C as QapiCommandTrait>::Ok, QmpError>
    where
        C: QapiCommandTrait + QmpCommand,
    {
        let (qmp, driver) = Self::connect(socket_path).await?;
        let response = qmp
            .execute(command)
            .await
            .map_err(|e: ExecuteError| QmpError::Command(format!("'{}' failed: {e}", C::NAME)))?;
        // Dropping the service handle lets the driver task wind down.
        drop(qmp);
        driver.await.map_err(|e| QmpError::Command(e.to_string()))?;
        Ok(response)
    }

    /// Graceful ACPI shutdown request.
    pub async fn system_powerdown(socket_path: &Path) -> Result<(), QmpError> {
        Self::execute(socket_path, system_powerdown {}).await?;
        Ok(())
    }

    /// Hard reset: disk, network and passthrough devices stay attached.
    pub async fn system_reset(socket_path: &Path) -> Result<(), QmpError> {
        Self::execute(socket_path, system_reset {}).await?;
        Ok(())
    }

    /// Terminate QEMU immediately.
    pub async fn quit(socket_path: &Path) -> Result<(), QmpError> {
        Self::execute(socket_path, quit {}).await?;
        Ok(())
    }

    /// A VM counts as running when its QMP socket negotiates.
    pub async fn is_vm_running(socket_path: &Path) -> bool {
        match QmpStreamTokio::open_uds(socket_path).await {
            Ok(stream) => stream.negotiate().await.is_ok(),
            Err(_) => false,
        }
    }
}
