//! Mailbox integration core for the CRM.

pub mod body;
pub mod client;
pub mod collab;
pub mod compose;
pub mod config;
pub mod error;
pub mod model;
pub mod ops;
pub mod store;
pub mod sync;
pub mod webhook;
