use std::collections::BTreeMap;

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig};

/// A consumer subscribed to one topic, with offsets committed only through
/// `commit`. Nothing is stored or committed automatically.
pub struct SingleTopicConsumer {
    consumer: StreamConsumer,
    topic: String,
}

/// An owned copy of a consumed record, detached from the consumer's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "session.timeout.ms",
                consumer_config.kafka_consumer_session_timeout_ms.to_string(),
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&self) -> Result<ReceivedMessage, RecvErr> {
        let message = self.consumer.recv().await?;
        Ok(ReceivedMessage {
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            partition: message.partition(),
            offset: message.offset(),
        })
    }

    /// Synchronously commit `offsets`, a map of partition to the next offset
    /// to read on that partition.
    pub fn commit(&self, offsets: &BTreeMap<i32, i64>) -> Result<(), OffsetErr> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(&self.topic, *partition, Offset::Offset(*next_offset))?;
        }

        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }
}
