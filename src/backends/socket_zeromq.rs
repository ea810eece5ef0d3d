//! Socket connector backed by the pure Rust `zeromq` crate

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use zeromq::{PubSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::socket::{PublisherSocket, SocketConnector};
use crate::message::Delivery;
use crate::transport::{Subscription, TransportError};

#[derive(Debug, Default, Clone, Copy)]
pub struct ZmqConnector;

impl ZmqConnector {
    pub fn new() -> Self {
        ZmqConnector
    }
}

#[async_trait]
impl SocketConnector for ZmqConnector {
    async fn open_publisher(
        &self,
        endpoint: &str,
    ) -> Result<Box<dyn PublisherSocket>, TransportError> {
        let mut socket = PubSocket::new();
        socket
            .connect(endpoint)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Box::new(ZmqPublisher {
            socket: Mutex::new(socket),
            open: AtomicBool::new(true),
        }))
    }

    async fn open_subscriber(
        &self,
        endpoint: &str,
        topic: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let mut socket = SubSocket::new();
        socket
            .connect(endpoint)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        socket
            .subscribe(topic)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Box::new(ZmqSubscription {
            socket,
            fallback_topic: topic.to_string(),
        }))
    }
}

struct ZmqPublisher {
    // The pool guarantees one user at a time; the lock only satisfies `&self`.
    socket: Mutex<PubSocket>,
    open: AtomicBool,
}

#[async_trait]
impl PublisherSocket for ZmqPublisher {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_frames(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        let frames: Vec<Bytes> = frames.into_iter().map(Bytes::from).collect();
        let message = ZmqMessage::try_from(frames)
            .map_err(|e| TransportError::Send(e.to_string()))?;

        let mut socket = self.socket.lock().await;
        socket.send(message).await.map_err(|e| {
            self.open.store(false, Ordering::Release);
            TransportError::Send(e.to_string())
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

struct ZmqSubscription {
    socket: SubSocket,
    fallback_topic: String,
}

#[async_trait]
impl Subscription for ZmqSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        let message = self
            .socket
            .recv()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut frames = message.into_vec();
        let delivery = match frames.len() {
            0 => Delivery::new(self.fallback_topic.clone(), Vec::new()),
            1 => Delivery::new(self.fallback_topic.clone(), frames.remove(0).to_vec()),
            _ => {
                let topic = String::from_utf8_lossy(&frames[0]).into_owned();
                Delivery::new(topic, frames[1].to_vec())
            }
        };
        Ok(Some(delivery))
    }
}
