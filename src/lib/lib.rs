pub mod compactor;
pub mod conditional;
pub mod config;
pub mod document;
pub mod entity;
pub mod error;
pub mod events;
pub mod gcp;
pub mod history;
pub mod index;
pub mod lease;
pub mod logging;
pub mod manifest;
pub mod object_store;
pub mod observability;
pub mod paths;
pub mod retry;
pub mod rules;
pub mod server;
pub mod snapshot;
pub mod timestamp;
