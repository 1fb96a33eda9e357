//! Delivery worker for the courier webhook dispatching service.

pub mod config;
pub mod error;
pub mod invoker;
pub mod supervisor;
pub mod worker;
