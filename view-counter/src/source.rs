use std::collections::BTreeMap;

use async_trait::async_trait;
use common_kafka::{OffsetErr, ReceivedMessage, RecvErr, SingleTopicConsumer};

/// Where the consumer loop pulls messages from.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    async fn recv(&self) -> Result<ReceivedMessage, RecvErr>;
}

/// Commits consumed positions once their batch has been stored. Offsets map
/// partition to the next offset to read.
pub trait OffsetCommitter: Send + Sync + 'static {
    fn commit(&self, offsets: &BTreeMap<i32, i64>) -> Result<(), OffsetErr>;
}

#[async_trait]
impl MessageSource for SingleTopicConsumer {
    async fn recv(&self) -> Result<ReceivedMessage, RecvErr> {
        SingleTopicConsumer::recv(self).await
    }
}

impl OffsetCommitter for SingleTopicConsumer {
    fn commit(&self, offsets: &BTreeMap<i32, i64>) -> Result<(), OffsetErr> {
        SingleTopicConsumer::commit(self, offsets)
    }
}
