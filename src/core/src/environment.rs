//! Which storage drivers the running process can actually use.

use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::backend::ServerClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverStatus {
    Available,
    Unavailable(String),
}

impl DriverStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, DriverStatus::Available)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DriverStatus::Available => None,
            DriverStatus::Unavailable(reason) => Some(reason),
        }
    }
}

/// Detected once per session and consulted by the capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentCapabilities {
    pub server_driver: DriverStatus,
    pub embedded_engine: DriverStatus,
}

impl EnvironmentCapabilities {
    pub fn new(server_driver: DriverStatus, embedded_engine: DriverStatus) -> Self {
        Self {
            server_driver,
            embedded_engine,
        }
    }

    pub fn all_available() -> Self {
        Self::new(DriverStatus::Available, DriverStatus::Available)
    }

    /// Pings the server (if one is configured) and checks that the embedded
    /// engine was built with R*Tree support.
    pub async fn detect(server: Option<&dyn ServerClient>, timeout: Duration) -> Self {
        let server_driver = match server {
            None => DriverStatus::Unavailable("no server connection configured".to_owned()),
            Some(client) => match tokio::time::timeout(timeout, client.ping()).await {
                Ok(Ok(())) => DriverStatus::Available,
                Ok(Err(e)) => DriverStatus::Unavailable(e.to_string()),
                Err(_) => DriverStatus::Unavailable(format!("ping timed out after {timeout:?}")),
            },
        };
        let embedded_engine = probe_embedded_engine();
        if let Some(reason) = server_driver.reason() {
            debug!(reason, "server driver unavailable");
        }
        if let Some(reason) = embedded_engine.reason() {
            warn!(reason, "embedded engine unavailable");
        }
        Self::new(server_driver, embedded_engine)
    }
}

fn probe_embedded_engine() -> DriverStatus {
    let check = || -> rusqlite::Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE VIRTUAL TABLE temp.lf_probe USING rtree(id, minx, maxx, miny, maxy);\n\
             DROP TABLE temp.lf_probe;",
        )
    };
    match check() {
        Ok(()) => DriverStatus::Available,
        Err(e) => DriverStatus::Unavailable(format!("embedded engine lacks spatial index support: {e}")),
    }
}
