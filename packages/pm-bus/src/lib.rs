mod bus;
mod event;
mod listener;
mod tx;

pub use bus::{Bus, SUBSCRIBER_BUFFER, Subscription};
pub use event::{Event, Topic, UnknownTopic};
pub use listener::run_notify_bridge;
pub use tx::{Envelope, PG_CHANNEL, TxEvents};
