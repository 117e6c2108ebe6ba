//! Backend families.
//!
//! Each family implements [`crate::connector::BlobBackend`] over a client
//! trait, so the same connector core runs against a real service or an
//! in-process stand-in:
//!
//! - object stores: [`object::ObjectStore`], with [`memory`] and [`aws`] clients
//! - document stores: [`sqlite`]
//! - log brokers: [`broker::LogBroker`], with [`broker_memory`] and the
//!   metadata indexes in [`index`]

pub mod aws;
pub mod broker;
pub mod broker_memory;
pub mod index;
pub mod memory;
pub mod object;
pub mod sqlite;
