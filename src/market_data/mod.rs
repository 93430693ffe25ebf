pub mod broker;
pub mod candle;
pub mod last_price;
pub mod subscription;
pub mod supervisor;
pub mod tick_bus;

pub use broker::{BrokerAdapter, SharedBroker, SimulatedBroker};
pub use candle::CandleEngine;
pub use last_price::LastPriceSource;
pub use subscription::SubscriptionRegistry;
pub use supervisor::MarketFeedSupervisor;
pub use tick_bus::TickBus;
