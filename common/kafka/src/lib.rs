pub mod config;
pub mod emitter;
pub mod kafka_consumer;
pub mod kafka_producer;


pub use emitter::{EventEmitter, EmitterConfig, KafkaTopicWriter, TopicWriter};
pub use kafka_consumer::{OffsetErr, ReceivedMessage, RecvErr, SingleTopicConsumer};
pub use kafka_producer::{create_kafka_producer, KafkaContext, KafkaProduceError};
