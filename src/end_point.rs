use crate::config::LinkConfig;
use crate::connection_state::ConnectionState;
use crate::message_dispatcher::MessageDispatcher;
use crate::packet::{Packet, SerialPacket};
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

/// The controller (client) side of a connection: one socket connected to one switcher.
///
/// The endpoint owns the socket and the keep-alive timer; the connection engine itself
///  is purely synchronous and lives behind a mutex so that [`Controller::send_messages`]
///  can be called from any task while [`Controller::run`] drives the protocol.
pub struct Controller {
    socket: Arc<UdpSocket>,
    switcher_addr: SocketAddr,
    connection: Mutex<ConnectionState>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<LinkConfig>,
}

impl Controller {
    /// Create the controller side of a fresh connection and transmit the initial
    ///  handshake. The connection only comes alive once the returned endpoint is driven
    ///  by [`Controller::run`].
    pub async fn connect(
        switcher_addr: SocketAddr,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<LinkConfig>,
    ) -> anyhow::Result<Controller> {
        config.validate()?;

        let socket = if switcher_addr.is_ipv4() {
            UdpSocket::bind("0.0.0.0:0").await?
        }
        else {
            UdpSocket::bind("[::]:0").await?
        };
        socket.connect(switcher_addr).await?;

        let connection = ConnectionState::controller(&mut rand::thread_rng());
        info!("connecting to switcher at {:?} as {}", switcher_addr, connection.id());

        let controller = Controller {
            socket: Arc::new(socket),
            switcher_addr,
            connection: Mutex::new(connection),
            message_dispatcher,
            config,
        };

        let handshake = controller.connection.lock().await.construct_keep_alive_packets();
        controller.send_packets(&handshake).await;
        Ok(controller)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Active loop - this function never returns, call it from a dedicated task. It
    ///  receives and interprets every datagram in arrival order and fires the keep-alive
    ///  tick that flushes acknowledgments and retransmits unacknowledged packets.
    pub async fn run(&self) {
        info!("starting controller loop for switcher at {:?}", self.switcher_addr);
        let mut keep_alive = interval(self.config.keep_alive_interval);
        let mut buf = vec![0u8; self.config.max_packet_len];

        loop {
            select! {
                received = self.socket.recv(&mut buf) => {
                    let num_read = match received {
                        Ok(num_read) => num_read,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };
                    self.on_datagram(Bytes::copy_from_slice(&buf[..num_read])).await;
                }
                _ = keep_alive.tick() => {
                    let packets = self.connection.lock().await.construct_keep_alive_packets();
                    self.send_packets(&packets).await;
                }
            }
        }
    }

    /// Package a batch of application messages into the next sequenced packet and
    ///  transmit it immediately.
    ///
    /// NB: This function does not return Result: a failed send is only logged, the
    ///  packet stays in the outbox and goes out again with the next keep-alive tick.
    pub async fn send_messages(&self, messages: Vec<Bytes>) {
        let packet = self.connection.lock().await.construct_packet(messages);
        self.send_packets(std::slice::from_ref(&packet)).await;
    }

    async fn on_datagram(&self, datagram: Bytes) {
        let packet = match Packet::deser(datagram) {
            Ok(packet) => packet,
            Err(_) => {
                warn!("received undecodable packet from {:?}, dropping", self.switcher_addr);
                return;
            }
        };
        trace!("received packet from {:?}: seq {:?}, ack {:?}, {} messages",
            self.switcher_addr, packet.sequence_number, packet.acknowledgment_number, packet.messages.len());

        let messages = self.connection.lock().await.interpret(packet);
        for message in messages {
            self.message_dispatcher.on_message(self.switcher_addr, &message).await;
        }
    }

    async fn send_packets(&self, packets: &[SerialPacket]) {
        for packet in packets {
            let mut buf = BytesMut::with_capacity(self.config.max_packet_len);
            packet.ser(&mut buf);
            trace!("sending to {:?}: {:?}", self.switcher_addr, packet);
            if let Err(e) = self.socket.send(&buf).await {
                error!("socket error sending to {:?}: {}", self.switcher_addr, e);
            }
        }
    }
}

/// The switcher (device) side: one listening socket serving any number of controllers,
///  with one connection engine per peer address.
pub struct Switcher {
    socket: Arc<UdpSocket>,
    connections: Mutex<FxHashMap<SocketAddr, ConnectionState>>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<LinkConfig>,
}

impl Switcher {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<LinkConfig>,
    ) -> anyhow::Result<Switcher> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        info!("bound switcher socket to {:?}", socket.local_addr()?);

        Ok(Switcher {
            socket: Arc::new(socket),
            connections: Default::default(),
            message_dispatcher,
            config,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Active loop - this function never returns, call it from a dedicated task.
    ///  Accepts new controllers (any connect packet from an unknown address), feeds
    ///  known connections in arrival order, and walks all connections on every
    ///  keep-alive tick.
    pub async fn run(&self) {
        info!("starting switcher loop");
        let mut keep_alive = interval(self.config.keep_alive_interval);
        let mut buf = vec![0u8; self.config.max_packet_len];

        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };
                    self.on_datagram(from, Bytes::copy_from_slice(&buf[..num_read])).await;
                }
                _ = keep_alive.tick() => {
                    let mut connections = self.connections.lock().await;
                    for (&peer_addr, connection) in connections.iter_mut() {
                        let packets = connection.construct_keep_alive_packets();
                        self.send_packets(peer_addr, &packets).await;
                    }
                }
            }
        }
    }

    /// Package a batch of application messages for one connected controller and
    ///  transmit it immediately.
    pub async fn send_messages(&self, to_addr: SocketAddr, messages: Vec<Bytes>) -> anyhow::Result<()> {
        let packet = match self.connections.lock().await.get_mut(&to_addr) {
            Some(connection) => connection.construct_packet(messages),
            None => bail!("no connection to {:?}", to_addr),
        };
        self.send_packets(to_addr, std::slice::from_ref(&packet)).await;
        Ok(())
    }

    async fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        let packet = match Packet::deser(datagram) {
            Ok(packet) => packet,
            Err(_) => {
                warn!("received undecodable packet from {:?}, dropping", from);
                return;
            }
        };

        let mut connections = self.connections.lock().await;
        let messages = match connections.entry(from) {
            Entry::Occupied(mut e) => e.get_mut().interpret(packet),
            Entry::Vacant(e) => {
                if !packet.is_connect {
                    warn!("received non-connect packet from unknown peer {:?}, dropping", from);
                    return;
                }
                debug!("new controller at {:?}", from);
                let connection = e.insert(ConnectionState::switcher(&packet));
                // push the initial-state burst right away rather than waiting for the
                //  next tick; it is retransmitted from the outbox until acknowledged
                let handshake = connection.construct_keep_alive_packets();
                self.send_packets(from, &handshake).await;
                return;
            }
        };
        drop(connections);

        for message in messages {
            self.message_dispatcher.on_message(from, &message).await;
        }
    }

    async fn send_packets(&self, to_addr: SocketAddr, packets: &[SerialPacket]) {
        for packet in packets {
            let mut buf = BytesMut::with_capacity(self.config.max_packet_len);
            packet.ser(&mut buf);
            trace!("sending to {:?}: {:?}", to_addr, packet);
            if let Err(e) = self.socket.send_to(&buf, to_addr).await {
                error!("socket error sending to {:?}: {}", to_addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_id::ConnectionId;
    use crate::initial_state::INITIAL_STATE;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::packet_id::PacketId;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Default)]
    struct CapturingDispatcher {
        received: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageDispatcher for CapturingDispatcher {
        async fn on_message(&self, _sender: SocketAddr, msg_buf: &[u8]) {
            self.received.lock().unwrap().push(msg_buf.to_vec());
        }
    }

    impl CapturingDispatcher {
        /// retransmissions may deliver a payload more than once, so assertions work on
        ///  the distinct set
        fn distinct(&self) -> Vec<Vec<u8>> {
            let mut all = self.received.lock().unwrap().clone();
            all.sort();
            all.dedup();
            all
        }
    }

    fn test_config() -> Arc<LinkConfig> {
        Arc::new(LinkConfig {
            keep_alive_interval: Duration::from_millis(10),
            max_packet_len: 1420,
        })
    }

    #[tokio::test]
    async fn test_handshake_and_message_exchange() {
        let config = test_config();

        let switcher_dispatcher = Arc::new(CapturingDispatcher::default());
        let switcher = Arc::new(Switcher::bind("127.0.0.1:0", switcher_dispatcher.clone(), config.clone()).await.unwrap());
        let switcher_addr = switcher.local_addr().unwrap();
        tokio::spawn({
            let switcher = switcher.clone();
            async move { switcher.run().await }
        });

        let controller_dispatcher = Arc::new(CapturingDispatcher::default());
        let controller = Arc::new(Controller::connect(switcher_addr, controller_dispatcher.clone(), config).await.unwrap());
        tokio::spawn({
            let controller = controller.clone();
            async move { controller.run().await }
        });

        sleep(Duration::from_millis(300)).await;

        // the whole initial-state burst must have reached the controller
        let initial = controller_dispatcher.distinct();
        assert_eq!(initial.len(), INITIAL_STATE.len());
        for payload in INITIAL_STATE {
            assert!(initial.contains(&payload.to_vec()));
        }

        let command = b"\x00\x00CPgI\x00\x00\x00\x02".to_vec();
        controller.send_messages(vec![Bytes::from(command.clone())]).await;
        sleep(Duration::from_millis(300)).await;
        assert!(switcher_dispatcher.distinct().contains(&command));
    }

    #[tokio::test]
    async fn test_switcher_drops_non_connect_packets_from_unknown_peers() {
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message().never();

        let switcher = Arc::new(Switcher::bind("127.0.0.1:0", Arc::new(dispatcher), test_config()).await.unwrap());
        let switcher_addr = switcher.local_addr().unwrap();
        tokio::spawn({
            let switcher = switcher.clone();
            async move { switcher.run().await }
        });

        let rogue = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = SerialPacket::sequenced(
            ConnectionId::from_raw(7),
            PacketId::from_raw(1),
            vec![Bytes::from_static(&[0, 0, 1, 2])],
        );
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        rogue.send_to(&buf, switcher_addr).await.unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(switcher.connections.lock().await.is_empty());
    }
}
