use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, ClientContext, Message, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::group::{
    Claim, ClaimHandler, ConsumerGroup, GroupError, OffsetErr, OffsetMarker, RawMessage,
};

pub struct GroupContext {
    errors: mpsc::UnboundedSender<GroupError>,
    // Bumped on every non-empty revocation, which ends the running session
    revocations: watch::Sender<u64>,
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        error!("librdkafka error: {}: {}", error, reason);
        let reported = GroupError::Client {
            error,
            reason: reason.to_string(),
        };
        if self.errors.send(reported).is_err() {
            debug!("broker error receiver is gone");
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // Cooperative rebalances send empty revocations, nothing moves
                if partitions.count() == 0 {
                    return;
                }
                info!("Revoking {} partitions", partitions.count());
                self.revocations.send_modify(|generation| *generation += 1);
            }
            Rebalance::Assign(partitions) => {
                info!("Assigning {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

/// An rdkafka consumer group member.
///
/// Offsets are never stored automatically: only what the pipeline marks through
/// the session gets committed, on the auto commit interval and on close.
pub struct KafkaGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
    subscribed: AtomicBool,
    claim_buffer: usize,
}

impl KafkaGroup {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, GroupError> {
        let client_config = client_config(common_config, consumer_config)?;

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (revocations, _) = watch::channel(0);
        let context = GroupContext {
            errors: errors_tx,
            revocations,
        };

        let consumer: StreamConsumer<GroupContext> = client_config.create_with_context(context)?;

        info!(
            hosts = %common_config.kafka_hosts,
            group = %consumer_config.kafka_consumer_group,
            offset_reset = consumer_config.kafka_consumer_offset_reset.as_str(),
            "Kafka consumer created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            errors: Mutex::new(Some(errors_rx)),
            subscribed: AtomicBool::new(false),
            claim_buffer: consumer_config.kafka_claim_buffer_size.max(1),
        })
    }
}

/// Build the librdkafka configuration for an event-log consumer.
pub fn client_config(
    common_config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
) -> Result<ClientConfig, GroupError> {
    let hosts = common_config.hosts();
    if hosts.is_empty() {
        return Err(GroupError::InvalidConfig(
            "kafka hosts are missing".to_string(),
        ));
    }
    if consumer_config.topics().is_empty() {
        return Err(GroupError::InvalidConfig("topics are missing".to_string()));
    }

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", hosts.join(","))
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set(
            "auto.offset.reset",
            consumer_config.kafka_consumer_offset_reset.as_str(),
        )
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            consumer_config
                .kafka_consumer_auto_commit_interval_ms
                .to_string(),
        )
        // Offsets are stored by the pipeline once the sink has flushed them
        .set("enable.auto.offset.store", "false");

    if let Some(version) = &common_config.kafka_version {
        client_config.set("broker.version.fallback", version);
    }

    if common_config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    Ok(client_config)
}

struct KafkaSession {
    consumer: Weak<StreamConsumer<GroupContext>>,
}

impl OffsetMarker for KafkaSession {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), OffsetErr> {
        let consumer = self.consumer.upgrade().ok_or(OffsetErr::Gone)?;
        consumer.store_offset(topic, partition, offset)?;
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for KafkaGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), GroupError> {
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&topics)?;
            info!("Subscribed to topics {:?}", topics);
        }

        let mut revocations = self.consumer.context().revocations.subscribe();
        let session: Arc<dyn OffsetMarker> = Arc::new(KafkaSession {
            consumer: Arc::downgrade(&self.consumer),
        });
        let mut claims: HashMap<(String, i32), mpsc::Sender<RawMessage>> = HashMap::new();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Consume session cancelled");
                    break;
                }

                _ = revocations.changed() => {
                    info!("Partitions revoked, ending consume session");
                    break;
                }

                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(message) => RawMessage {
                            topic: message.topic().to_string(),
                            partition: message.partition(),
                            offset: message.offset(),
                            payload: message.payload().map(<[u8]>::to_vec),
                        },
                        Err(e) => {
                            warn!("Error receiving message: {}", e);
                            if self.consumer.context().errors.send(e.into()).is_err() {
                                debug!("broker error receiver is gone");
                            }
                            continue;
                        }
                    };

                    let key = (message.topic.clone(), message.partition);
                    let claim = claims.entry(key).or_insert_with(|| {
                        info!(
                            topic = %message.topic,
                            partition = message.partition,
                            "Starting partition claim"
                        );
                        let (tx, rx) = mpsc::channel(self.claim_buffer);
                        let claim = Claim {
                            topic: message.topic.clone(),
                            partition: message.partition,
                            messages: rx,
                        };
                        let handler = handler.clone();
                        let session = session.clone();
                        handlers.spawn(handler.consume_claim(session, claim));
                        tx
                    });

                    // Waits here when the claim handler is behind, which throttles the fetch
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = claim.send(message) => {
                            if let Err(mpsc::error::SendError(dropped)) = sent {
                                debug!(
                                    topic = %dropped.topic,
                                    partition = dropped.partition,
                                    offset = dropped.offset,
                                    "Claim handler stopped, message left for redelivery"
                                );
                            }
                        }
                    }
                }
            }
        }

        // Closing the claim channels lets the handlers drain and exit
        drop(claims);
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!("Partition claim handler failed: {}", e);
            }
        }

        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>> {
        self.errors.lock().ok()?.take()
    }

    async fn close(&self) -> Result<(), GroupError> {
        info!("Closing Kafka consumer group");

        let committed = match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("No stored offsets left to commit");
                Ok(())
            }
            Err(e) => {
                error!("Failed to commit stored offsets: {}", e);
                Err(e.into())
            }
        };

        self.consumer.unsubscribe();
        committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommaSeparated, OffsetReset};

    fn configs() -> (KafkaConfig, ConsumerConfig) {
        (
            KafkaConfig {
                kafka_hosts: "kafka-1:9092,kafka-2:9092".to_string(),
                kafka_tls: false,
                kafka_version: None,
            },
            ConsumerConfig {
                kafka_consumer_group: "event-log-consumer".to_string(),
                kafka_consumer_topics: CommaSeparated(vec!["event-log".to_string()]),
                kafka_consumer_offset_reset: OffsetReset::Oldest,
                kafka_consumer_auto_commit_interval_ms: 1000,
                kafka_claim_buffer_size: 10,
            },
        )
    }

    #[test]
    fn client_config_stores_offsets_manually() {
        let (common, consumer) = configs();
        let config = client_config(&common, &consumer).expect("valid config");

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("group.id"), Some("event-log-consumer"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("1000"));
        assert_eq!(config.get("broker.version.fallback"), None);
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn client_config_maps_version_and_tls() {
        let (mut common, consumer) = configs();
        common.kafka_version = Some("2.6.0".to_string());
        common.kafka_tls = true;

        let config = client_config(&common, &consumer).expect("valid config");
        assert_eq!(config.get("broker.version.fallback"), Some("2.6.0"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn client_config_requires_hosts_and_topics() {
        let (mut common, consumer) = configs();
        common.kafka_hosts = " , ".to_string();
        assert!(matches!(
            client_config(&common, &consumer),
            Err(GroupError::InvalidConfig(_))
        ));

        let (common, mut consumer) = configs();
        consumer.kafka_consumer_topics = CommaSeparated::default();
        assert!(matches!(
            client_config(&common, &consumer),
            Err(GroupError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn errors_are_handed_out_once() {
        let (common, consumer) = configs();
        let group = KafkaGroup::new(&common, &consumer).expect("failed to create consumer");

        assert!(group.take_errors().is_some());
        assert!(group.take_errors().is_none());
    }
}
