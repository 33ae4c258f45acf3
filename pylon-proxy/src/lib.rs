pub mod balancer;
pub mod breaker;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod pool;
pub mod proxy;
pub mod timeout;
pub mod worker;
