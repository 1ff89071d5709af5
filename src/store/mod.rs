pub mod entity_store;
pub mod observer;

pub use entity_store::{ApplyReport, EntityStore, StoreChange, StoreEvent, StoreSnapshot};
pub use observer::{StoreSubscription, SubscriptionId};
