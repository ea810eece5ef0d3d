//! Log connector backed by `rdkafka`

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::log::{LogConnector, LogProducer, LogRecord};
use crate::config::LogSettings;
use crate::message::Delivery;
use crate::transport::{Subscription, TransportError};

pub struct KafkaConnector {
    settings: LogSettings,
}

impl KafkaConnector {
    pub fn new(settings: &LogSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.bootstrap_servers)
            .set("client.id", &self.settings.client_id);
        config
    }
}

#[async_trait]
impl LogConnector for KafkaConnector {
    async fn create_producer(&self) -> Result<Box<dyn LogProducer>, TransportError> {
        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", self.settings.send_timeout_ms.to_string())
            .create()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Box::new(KafkaProducer {
            producer,
            ready: AtomicBool::new(true),
        }))
    }

    async fn open_consumer(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Box::new(KafkaSubscription {
            consumer: Arc::new(consumer),
            pending: None,
        }))
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    ready: AtomicBool,
}

#[async_trait]
impl LogProducer for KafkaProducer {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn send(&self, record: &LogRecord, timeout: Duration) -> Result<(), TransportError> {
        let mut outgoing: FutureRecord<'_, String, Vec<u8>> = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload);

        if !record.headers.is_empty() {
            let headers = record
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_str()),
                    })
                });
            outgoing = outgoing.headers(headers);
        }

        self.producer
            .send(outgoing, Timeout::After(timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| TransportError::Send(e.to_string()))
    }

    fn close(&self) {
        self.ready.store(false, Ordering::Release);
        let producer = self.producer.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn_blocking(move || {
                if let Err(e) = producer.flush(Timeout::After(Duration::from_secs(5))) {
                    debug!(error = %e, "log producer flush failed");
                }
            });
        }
    }
}

struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    pending: Option<(String, i32, i64)>,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .detach();

        let mut delivery = Delivery::new(
            message.topic().to_string(),
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        );
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                let value = header
                    .value
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                delivery.headers.insert(header.key.to_string(), value);
            }
        }

        self.pending = Some((
            message.topic().to_string(),
            message.partition(),
            message.offset(),
        ));
        Ok(Some(delivery))
    }

    async fn ack(&mut self) -> Result<(), TransportError> {
        if let Some((topic, partition, offset)) = self.pending.take() {
            // The stored offset is the next one to read
            self.consumer
                .store_offset(&topic, partition, offset + 1)
                .map_err(|e| TransportError::Send(e.to_string()))?;
        }
        Ok(())
    }

    async fn nack(&mut self) -> Result<(), TransportError> {
        self.pending = None;
        Ok(())
    }
}
