//! Runs the receiver against the current kube context, logging every record it emits
//!
//! Usage: `objects [config.yaml]`. Without a file, pods are watched in all namespaces.
use std::sync::Arc;

use async_trait::async_trait;
use kube_objects::{Config, ConsumerError, Logs, LogsConsumer, ObjectsReceiver, ReceiverId};
use tracing::info;

const DEFAULT_CONFIG: &str = "
objects:
  - name: pods
    mode: watch
";

struct PrintRecords;

#[async_trait]
impl LogsConsumer for PrintRecords {
    async fn consume_logs(&self, logs: Logs) -> Result<(), ConsumerError> {
        for resource in &logs.resource_logs {
            for record in &resource.records {
                info!(attributes = ?resource.attributes, record = ?record.attributes, "{}", record.body);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config: Config = match std::env::args().nth(1) {
        Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_yaml::from_str(DEFAULT_CONFIG)?,
    };

    let receiver = ObjectsReceiver::try_new(ReceiverId::default(), &config, Arc::new(PrintRecords)).await?;
    receiver.start()?;
    info!("collecting, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    receiver.shutdown()?;
    Ok(())
}
