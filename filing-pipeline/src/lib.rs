pub mod config;
pub mod coordinator;
pub mod edgar_utils;
pub mod fetcher;
pub mod parser;
pub mod poller;
pub mod registry;
pub mod signals;
pub mod sources;
pub mod store;
pub mod traits;
pub mod types;

pub use config::{Cli, Command};
pub use coordinator::ProcessingCoordinator;
pub use fetcher::Fetcher;
pub use parser::{parse_search_page, SearchPage};
pub use poller::{FeedPoller, PollerState};
pub use registry::{ExtractorRegistry, ExtractorRegistryBuilder};
pub use signals::SignalHistory;
pub use sources::EdgarFeedSource;
pub use store::FilingStore;
pub use traits::FilingFeed;
pub use types::*;
