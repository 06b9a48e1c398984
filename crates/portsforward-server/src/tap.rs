//! Append-only data files receiving a copy of forwarded bytes

use std::path::{Path, PathBuf};
use std::sync::Arc;

use portsforward_config::ForwardSettings;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::ServerError;
use crate::pump::Direction;

/// One data file, shared by every pump of its direction
///
/// Each chunk is appended whole and synced before the next one starts, so
/// chunks from concurrent connections may interleave but never split.
#[derive(Debug)]
pub struct DataTap {
    path: PathBuf,
    file: Mutex<File>,
}

impl DataTap {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| ServerError::TapError {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

/// Upstream and downstream data files, both optional
#[derive(Debug, Clone, Default)]
pub struct DataTaps {
    pub up: Option<Arc<DataTap>>,
    pub down: Option<Arc<DataTap>>,
}

impl DataTaps {
    pub fn none() -> Self {
        Self::default()
    }

    /// Open the files named in `settings`
    pub async fn open(settings: &ForwardSettings) -> Result<Self, ServerError> {
        let up = match &settings.up_tap_path {
            Some(path) => {
                info!("Writing upstream data to {}", path.display());
                Some(Arc::new(DataTap::open(path).await?))
            }
            None => None,
        };
        let down = match &settings.down_tap_path {
            Some(path) => {
                info!("Writing downstream data to {}", path.display());
                Some(Arc::new(DataTap::open(path).await?))
            }
            None => None,
        };

        Ok(Self { up, down })
    }

    pub fn for_direction(&self, direction: Direction) -> Option<Arc<DataTap>> {
        match direction {
            Direction::Upstream => self.up.clone(),
            Direction::Downstream => self.down.clone(),
        }
    }
}
