pub mod config;
pub mod dispatch;
pub mod itinerary;
pub mod runtime;
pub mod scheduling;
pub mod shared;
pub mod store;
