//! The four exchange-topology patterns: each client is a thin composition of
//! the shared topology binder, publisher, and consumer loop.

mod direct;
mod fanout;
mod headers;
mod topic;

pub use direct::DirectExchange;
pub use fanout::FanoutExchange;
pub use headers::HeadersExchange;
pub use topic::TopicExchange;
