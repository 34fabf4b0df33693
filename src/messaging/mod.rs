mod broker;
mod consumer;
mod producer;
pub mod topology;

pub use broker::{build_pool, BrokerError, Pool};
pub use consumer::{Consumer, ConsumerError, Job};
pub use producer::{Producer, ProducerError};
