use async_trait::async_trait;

use crate::defs::ExtractedData;
use crate::defs::Signal;
use crate::defs::SignalGenerator;

pub struct EmptySignalGenerator;

#[async_trait]
impl SignalGenerator for EmptySignalGenerator {
    fn generator_name(&self) -> String {
        "empty".to_owned()
    }

    async fn generate(&self, _data: &ExtractedData) -> anyhow::Result<Vec<Signal>> {
        // Nothing is ever warranted.
        Ok(vec![])
    }
}
