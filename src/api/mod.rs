pub mod quotes;

pub use quotes::{QuoteSource, RestQuoteClient};
