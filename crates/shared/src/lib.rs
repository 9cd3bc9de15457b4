//! Runtime utilities shared by the router and post-auction services.

pub mod banker;
pub mod outbox;
pub mod timeout_map;
