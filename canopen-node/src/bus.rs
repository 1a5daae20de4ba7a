//! The CAN bus adapter (C2): a transport-agnostic fanout around a raw CAN link.
//!
//! [`CanBus`] owns a background task that reads frames off a [`CanTransport`] and republishes
//! them on a [`tokio::sync::broadcast`] channel, so every component that cares about bus traffic
//! (SDO server, PDO engine, NMT/heartbeat, SYNC) can subscribe independently without fighting over
//! a single receiver.

use std::sync::Arc;

use canopen_common::messages::{CanError, CanMessage};
use log::warn;
use tokio::sync::broadcast;

/// Depth of the fanout channel. A slow subscriber that falls this far behind starts missing
/// frames (receiving `RecvError::Lagged`) rather than stalling the reader task.
const BUS_CHANNEL_CAPACITY: usize = 256;

/// A concrete CAN link: something that can send and receive raw frames.
///
/// Implemented for whatever transport a node runs on; [`LoopbackTransport`] and, on Linux,
/// [`SocketCanTransport`] are provided here.
pub trait CanTransport: Send + Sync + 'static {
    /// Send a single frame
    fn send(
        &self,
        msg: CanMessage,
    ) -> impl std::future::Future<Output = Result<(), CanError>> + Send;

    /// Wait for the next received frame
    fn recv(&self) -> impl std::future::Future<Output = Result<CanMessage, CanError>> + Send;
}

/// The shared bus handle components clone and hold onto.
pub struct CanBus<T: CanTransport> {
    transport: Arc<T>,
    incoming: broadcast::Sender<CanMessage>,
    reader: tokio::task::JoinHandle<()>,
}

impl<T: CanTransport> Drop for CanBus<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl<T: CanTransport> CanBus<T> {
    /// Wrap a transport, starting the background reader task that feeds [`Self::subscribe`].
    pub fn new(transport: T) -> Self {
        let transport = Arc::new(transport);
        let (incoming, _) = broadcast::channel(BUS_CHANNEL_CAPACITY);

        let reader_transport = transport.clone();
        let reader_tx = incoming.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader_transport.recv().await {
                    Ok(msg) => {
                        // No receivers is not an error: nothing has subscribed yet.
                        let _ = reader_tx.send(msg);
                    }
                    Err(e) => {
                        warn!("CAN bus read error: {e}");
                    }
                }
            }
        });

        Self {
            transport,
            incoming,
            reader,
        }
    }

    /// Send a frame onto the bus
    pub async fn send(&self, msg: CanMessage) -> Result<(), CanError> {
        self.transport.send(msg).await
    }

    /// Subscribe to every frame the reader task observes from here on
    pub fn subscribe(&self) -> broadcast::Receiver<CanMessage> {
        self.incoming.subscribe()
    }
}

/// An in-process transport that loops every sent frame back as a received one.
///
/// Useful for tests and for a node with no physical bus: a node still needs to see its own SYNC
/// and heartbeat frames go by if another task on the same process is acting as master.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    tx: tokio::sync::mpsc::UnboundedSender<CanMessage>,
    rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<CanMessage>>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

impl CanTransport for LoopbackTransport {
    async fn send(&self, msg: CanMessage) -> Result<(), CanError> {
        self.tx.send(msg).map_err(|_| CanError::InterfaceDown)
    }

    async fn recv(&self) -> Result<CanMessage, CanError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(CanError::InterfaceDown)
    }
}

#[cfg(target_os = "linux")]
mod socketcan_transport {
    use super::*;
    use canopen_common::messages::CanId;
    use socketcan::{tokio::CanSocket, CanFrame, EmbeddedFrame, ExtendedId, Frame, ShouldRetry, StandardId};

    fn to_can_id(id: socketcan::CanId) -> CanId {
        match id {
            socketcan::CanId::Standard(id) => CanId::Std(id.as_raw()),
            socketcan::CanId::Extended(id) => CanId::Extended(id.as_raw()),
        }
    }

    fn from_can_id(id: CanId) -> socketcan::CanId {
        match id {
            CanId::Extended(id) => ExtendedId::new(id)
                .expect("29-bit id exceeds socketcan limit")
                .into(),
            CanId::Std(id) => StandardId::new(id)
                .expect("11-bit id exceeds socketcan limit")
                .into(),
        }
    }

    fn frame_to_message(frame: CanFrame) -> Result<CanMessage, CanError> {
        let id = to_can_id(frame.can_id());
        match frame {
            CanFrame::Data(frame) => Ok(CanMessage::new(id, frame.data())),
            CanFrame::Remote(_) => Ok(CanMessage::new_rtr(id)),
            CanFrame::Error(frame) => Err(CanError::Io {
                message: format!("CAN error frame: {:?}", frame.error_bits()),
            }),
        }
    }

    fn message_to_frame(msg: CanMessage) -> CanFrame {
        let id = from_can_id(msg.id());
        if msg.is_rtr() {
            CanFrame::new_remote(id, 0).expect("RTR frame construction cannot fail")
        } else {
            CanFrame::new(id, msg.data()).expect("data frame construction cannot fail")
        }
    }

    /// A live SocketCAN interface (e.g. `can0`, `vcan0`).
    pub struct SocketCanTransport {
        socket: CanSocket,
    }

    impl SocketCanTransport {
        /// Open a SocketCAN interface by name
        pub fn open(interface: &str) -> Result<Self, CanError> {
            let socket = CanSocket::open(interface).map_err(|e| CanError::Io {
                message: format!("opening {interface}: {e}"),
            })?;
            Ok(Self { socket })
        }
    }

    impl CanTransport for SocketCanTransport {
        async fn send(&self, msg: CanMessage) -> Result<(), CanError> {
            self.socket
                .write_frame(message_to_frame(msg))
                .await
                .map_err(|e| CanError::Io {
                    message: e.to_string(),
                })
        }

        async fn recv(&self) -> Result<CanMessage, CanError> {
            loop {
                match self.socket.read_frame().await {
                    Ok(frame) => return frame_to_message(frame),
                    Err(e) if e.should_retry() => continue,
                    Err(e) => {
                        return Err(CanError::Io {
                            message: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use socketcan_transport::SocketCanTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_echoes_sent_frames() {
        let bus = CanBus::new(LoopbackTransport::default());
        let mut rx = bus.subscribe();

        let msg = CanMessage::new(canopen_common::CanId::Std(0x123), &[1, 2, 3]);
        bus.send(msg).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id(), msg.id());
        assert_eq!(received.data(), msg.data());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_see_frames() {
        let bus = CanBus::new(LoopbackTransport::default());
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let msg = CanMessage::new_rtr(canopen_common::CanId::Std(0x80));
        bus.send(msg).await.unwrap();

        assert!(rx1.recv().await.unwrap().is_rtr());
        assert!(rx2.recv().await.unwrap().is_rtr());
    }
}
