//! MQTT backend
//!
//! The pooled resource is a connected client session. Every session gets its
//! own client id, since a broker drops the older of two sessions sharing
//! one. MQTT 3.1.1 has no user properties, so headers are not forwarded.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{MqttSettings, Password};
use crate::message::Envelope;
use crate::transport::{BackendKind, Subscribe, Subscription, Transport, TransportError};

/// Everything needed to open one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Password,
    pub clean_session: bool,
    pub keep_alive: Duration,
}

/// One PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[async_trait]
pub trait MqttSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, message: MqttPublish) -> Result<(), TransportError>;

    /// Start a clean disconnect. Must not block.
    fn disconnect(&self) {}
}

#[async_trait]
pub trait MqttConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        options: &MqttSessionOptions,
    ) -> Result<Box<dyn MqttSession>, TransportError>;

    async fn subscribe(
        &self,
        options: &MqttSessionOptions,
        topic: &str,
        qos: u8,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

pub struct MqttTransport {
    connector: Arc<dyn MqttConnector>,
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(connector: Arc<dyn MqttConnector>, settings: MqttSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Options for a new session, with a fresh client id
    pub fn session_options(&self) -> MqttSessionOptions {
        MqttSessionOptions {
            client_id: self.settings.session_client_id(),
            host: self.settings.host.clone(),
            port: self.settings.port,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            clean_session: self.settings.clean_session,
            keep_alive: self.settings.keep_alive(),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Handle = Box<dyn MqttSession>;

    fn kind(&self) -> BackendKind {
        BackendKind::Mqtt
    }

    fn endpoint(&self) -> String {
        self.settings.endpoint()
    }

    async fn connect(&self) -> Result<Self::Handle, TransportError> {
        self.connector.connect(&self.session_options()).await
    }

    fn is_usable(&self, handle: &Self::Handle) -> bool {
        handle.is_connected()
    }

    async fn send(&self, handle: &Self::Handle, envelope: &Envelope) -> Result<(), TransportError> {
        handle
            .publish(MqttPublish {
                topic: envelope.destination.topic_name().to_string(),
                payload: envelope.payload.clone(),
                qos: self.settings.qos,
                retain: self.settings.retain,
            })
            .await
    }

    fn close(&self, handle: Self::Handle) {
        handle.disconnect();
    }

    fn forwards_headers(&self) -> bool {
        false
    }
}

#[async_trait]
impl Subscribe for MqttTransport {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.connector
            .subscribe(&self.session_options(), topic, self.settings.qos)
            .await
    }
}
