//! MQTT connector backed by `rumqttc`
//!
//! Every session owns an event loop. It is polled until the broker's CONNACK
//! arrives, then handed to a background task; the session reports itself
//! disconnected once that task stops.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::mqtt::{MqttConnector, MqttPublish, MqttSession, MqttSessionOptions};
use crate::message::Delivery;
use crate::transport::{Subscription, TransportError};

/// Requests buffered between the client and its event loop
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttcConnector;

impl RumqttcConnector {
    pub fn new() -> Self {
        RumqttcConnector
    }
}

fn mqtt_options(options: &MqttSessionOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(options.clean_session);
    if !options.username.is_empty() {
        mqtt.set_credentials(options.username.clone(), options.password.expose().to_string());
    }
    mqtt
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Poll until the session is acknowledged
async fn establish(
    options: &MqttSessionOptions,
) -> Result<(AsyncClient, EventLoop), TransportError> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(options), CHANNEL_CAPACITY);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok((client, eventloop));
                }
                return Err(TransportError::Authentication(format!("{:?}", ack.code)));
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Authentication(format!("{:?}", code)));
            }
            Err(e) => return Err(TransportError::Connection(e.to_string())),
        }
    }
}

#[async_trait]
impl MqttConnector for RumqttcConnector {
    async fn connect(
        &self,
        options: &MqttSessionOptions,
    ) -> Result<Box<dyn MqttSession>, TransportError> {
        let (client, mut eventloop) = establish(options).await?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let client_id = options.client_id.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Disconnect))
                    | Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(client_id = %client_id, error = %e, "mqtt event loop stopped");
                        break;
                    }
                }
            }
            flag.store(false, Ordering::Release);
        });

        Ok(Box::new(RumqttcSession { client, connected }))
    }

    async fn subscribe(
        &self,
        options: &MqttSessionOptions,
        topic: &str,
        level: u8,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let (client, eventloop) = establish(options).await?;
        client
            .subscribe(topic, qos(level))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Box::new(RumqttcSubscription {
            _client: client,
            eventloop,
        }))
    }
}

struct RumqttcSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl MqttSession for RumqttcSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, message: MqttPublish) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.client
            .publish(message.topic, qos(message.qos), message.retain, message.payload)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "mqtt disconnect request failed");
        }
    }
}

struct RumqttcSubscription {
    _client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl Subscription for RumqttcSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(Delivery::new(publish.topic, publish.payload.to_vec())));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connection(e.to_string())),
            }
        }
    }
}
