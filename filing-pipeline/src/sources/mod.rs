pub mod edgar_feed;

pub use edgar_feed::EdgarFeedSource;
