pub mod circuit_breaker;
pub mod headers;
pub mod health;
pub mod message;
pub mod response;
pub mod retry;
pub mod status;
