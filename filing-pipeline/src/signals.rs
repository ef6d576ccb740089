use crate::types::Signal;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Append-only in-process record of generated signals.
///
/// The durable copy lives in the store; this one is what a running process
/// has produced since startup.
#[derive(Clone, Default)]
pub struct SignalHistory {
    signals: Arc<RwLock<Vec<Signal>>>,
}

impl SignalHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, signals: &[Signal]) {
        if signals.is_empty() {
            return;
        }
        let mut history = self.signals.write().await;
        history.extend_from_slice(signals);
    }

    pub async fn snapshot(&self) -> Vec<Signal> {
        self.signals.read().await.clone()
    }

    pub async fn for_company(&self, company_id: &str) -> Vec<Signal> {
        self.signals
            .read()
            .await
            .iter()
            .filter(|s| s.company_id == company_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.signals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.signals.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.signals.write().await.clear();
    }
}
