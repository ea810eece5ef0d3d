//! AMQP connector backed by `lapin`
//!
//! One connection per connector, shared by every pooled channel and reopened
//! on demand once it is no longer connected.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::amqp::{AmqpChannel, AmqpConnector, AmqpProperties};
use crate::config::AmqpSettings;
use crate::message::Delivery;
use crate::transport::{Subscription, TransportError};

pub struct LapinConnector {
    uri: String,
    connection_name: String,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl LapinConnector {
    pub fn new(settings: &AmqpSettings) -> Self {
        Self {
            uri: settings.uri(),
            connection_name: settings.connection_name.clone(),
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, TransportError> {
        let mut current = self.connection.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.status().connected() {
                return Ok(Arc::clone(conn));
            }
        }

        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));
        let conn = Connection::connect(&self.uri, properties)
            .await
            .map_err(connect_error)?;
        debug!(name = %self.connection_name, "amqp connection established");

        let conn = Arc::new(conn);
        *current = Some(Arc::clone(&conn));
        Ok(conn)
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, TransportError> {
        let conn = self.connection().await?;
        let channel = conn.create_channel().await.map_err(channel_error)?;
        Ok(Box::new(LapinChannel { channel }))
    }

    async fn open_consumer(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let conn = self.connection().await?;
        let channel = conn.create_channel().await.map_err(channel_error)?;
        let tag = format!("{}-{}", self.connection_name, queue);
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        Ok(Box::new(LapinSubscription {
            queue: queue.to_string(),
            _channel: channel,
            consumer,
            pending: None,
        }))
    }
}

fn connect_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(_) => TransportError::Connection(err.to_string()),
        lapin::Error::ProtocolError(_) => TransportError::Authentication(err.to_string()),
        other => TransportError::Connection(other.to_string()),
    }
}

fn channel_error(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed
        }
        lapin::Error::ProtocolError(_) => TransportError::Rejected(err.to_string()),
        other => TransportError::Send(other.to_string()),
    }
}

struct LapinChannel {
    channel: Channel,
}

fn basic_properties(properties: &AmqpProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(properties.delivery_mode)
        .with_content_type(ShortString::from(properties.content_type.clone()));

    if let Some(id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        basic = basic.with_headers(table);
    }
    basic
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &AmqpProperties,
        body: &[u8],
        await_confirm: bool,
    ) -> Result<(), TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await
            .map_err(channel_error)?;

        if await_confirm {
            let confirmation = confirm.await.map_err(channel_error)?;
            if confirmation.is_nack() {
                return Err(TransportError::Rejected(
                    "broker returned a negative publisher confirm".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn close(&self) {
        let channel = self.channel.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = channel.close(200, "OK").await {
                    debug!(error = %e, "amqp channel close failed");
                }
            });
        }
    }
}

struct LapinSubscription {
    queue: String,
    _channel: Channel,
    consumer: Consumer,
    pending: Option<Acker>,
}

fn header_text(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        other => format!("{:?}", other),
    }
}

#[async_trait]
impl Subscription for LapinSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        let delivery = match self.consumer.next().await {
            None => return Ok(None),
            Some(result) => result.map_err(channel_error)?,
        };

        let properties = &delivery.properties;
        let mut received = Delivery::new(self.queue.clone(), delivery.data.clone());
        if let Some(headers) = properties.headers() {
            for (key, value) in headers.inner() {
                received
                    .headers
                    .insert(key.as_str().to_string(), header_text(value));
            }
        }
        received.correlation_id = properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string());
        received.message_id = properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string());

        self.pending = Some(delivery.acker);
        Ok(Some(received))
    }

    async fn ack(&mut self) -> Result<(), TransportError> {
        if let Some(acker) = self.pending.take() {
            acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(channel_error)?;
        }
        Ok(())
    }

    async fn nack(&mut self) -> Result<(), TransportError> {
        if let Some(acker) = self.pending.take() {
            acker
                .nack(BasicNackOptions::default())
                .await
                .map_err(channel_error)?;
        }
        Ok(())
    }
}
