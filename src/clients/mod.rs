pub mod broker;
pub mod circuit_breaker;
pub mod database;
pub mod email;
pub mod health;
pub mod ledger;
pub mod memory;
pub mod rbmq;
pub mod redis;
