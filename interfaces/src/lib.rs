pub mod baseline;
pub mod defs;
pub mod empty;

pub use baseline::BaselineExtractor;
pub use defs::{ExtractedData, ExtractionError, Extractor, FilingRef, Signal, SignalGenerator};
pub use empty::EmptySignalGenerator;
