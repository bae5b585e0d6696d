pub mod app;
pub mod config;
pub mod diff;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod import;
pub mod ledger;
pub mod observer;
pub mod output;
pub mod paging;
pub mod query;
pub mod remote;
pub mod source;
pub mod store;
pub mod transfer;
