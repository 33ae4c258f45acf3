pub mod chain;
pub mod events;
pub mod metrics;
pub mod plugin;
pub mod registry;
