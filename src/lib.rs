pub mod config;
pub mod estimation;
pub mod link;
pub mod messages;
pub mod pipeline;
pub mod queue;
pub mod runtime;
