//! Farm manager: render-farm coordination core.

pub mod config;
pub mod error;
pub mod eventbus;
pub mod farmstatus;
pub mod model;
pub mod store;
pub mod worker;
