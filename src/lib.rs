pub mod api;
pub mod clients;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod models;
pub mod publisher;
pub mod utils;
pub mod worker;
