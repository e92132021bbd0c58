use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{Broker, BrokerError};

static ACTIVE_BROKERS: Lazy<Mutex<HashMap<u16, Arc<Broker>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide broker ownership, keyed by cluster port.
///
/// Reprovisioning acquires the same running instance instead of opening the
/// data directory twice; the registry owns broker lifetimes.
pub struct BrokerRegistry;

impl BrokerRegistry {
    pub fn acquire(port: u16, data_dir: impl AsRef<Path>) -> Result<Arc<Broker>, BrokerError> {
        let mut brokers = ACTIVE_BROKERS.lock();
        if let Some(existing) = brokers.get(&port) {
            tracing::info!(port, "broker already running for this port, reusing instance");
            return Ok(existing.clone());
        }
        let broker = Broker::open(data_dir)?;
        brokers.insert(port, broker.clone());
        Ok(broker)
    }

    /// Drops the registry's handle for a port. Outstanding clones keep the
    /// instance alive until they are gone.
    pub fn release(port: u16) {
        ACTIVE_BROKERS.lock().remove(&port);
    }
}
