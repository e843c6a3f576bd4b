//! Off-chain batch-auction order tracking

mod api;
mod watcher;

pub use api::{HttpOrderApi, OrderApi, RemoteOrder, RemoteOrderStatus};
pub use watcher::OrderStatusWatcher;

#[cfg(test)]
pub use api::MockOrderApi;
