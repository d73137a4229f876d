// Market data, ladder state and order handling
pub mod candle_aggregator;
pub mod coordinator;
pub mod events;
pub mod ladder;
pub mod ladder_book;
pub mod price_cache;
pub mod price_feed;

pub use candle_aggregator::CandleAggregator;
pub use coordinator::{
    CoordinatorError, CoordinatorSettings, IntentKey, IntentKind, IntentState, OrderCoordinator,
    PlacementOutcome,
};
pub use events::{event_channel, EventOutbox, EventPublisher};
pub use ladder::{Ladder, LadderAction, LadderError, LadderParams, LadderState};
pub use ladder_book::{LadderBook, LadderView};
pub use price_cache::{PriceCache, Quote};
pub use price_feed::{tick_channel, PriceFeedManager, TickSender};
