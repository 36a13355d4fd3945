pub mod adaptor;
pub mod app;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod counter;
pub mod domain;
pub mod error;
pub mod kv;
pub mod lock;
pub mod manager;
pub mod models;
pub mod output;
pub mod store;
pub mod sync;
