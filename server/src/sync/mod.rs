//! Cross-instance synchronization over a partitioned distributed log.

pub mod config;
pub mod consumer;
pub mod envelope;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod log;
pub mod memory;
pub mod producer;

use std::sync::Arc;

pub use config::{LogBackend, SyncConfig};
pub use consumer::SyncConsumer;
pub use log::{DistributedLog, LogError};
pub use memory::MemoryLog;
pub use producer::SyncProducer;

/// Open the configured log backend.
pub fn connect(config: &SyncConfig) -> Result<Arc<dyn DistributedLog>, LogError> {
    match config.backend {
        LogBackend::Memory => Ok(Arc::new(MemoryLog::new(config.partitions))),
        #[cfg(feature = "kafka")]
        LogBackend::Kafka => Ok(Arc::new(kafka::KafkaLog::connect(config)?)),
        #[cfg(not(feature = "kafka"))]
        LogBackend::Kafka => Err(LogError::Backend(
            "kafka backend requires building with the `kafka` feature".to_string(),
        )),
    }
}

/// Random instance id of the form `instance-<16 hex>`.
pub fn generate_instance_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("instance-{hex}")
}
