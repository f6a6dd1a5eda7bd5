//! SyncML over OBEX.
//!
//! The client connects to the `SYNCML-SYNC` target, sends each message as a
//! PUT and fetches the reply with GET. Bluetooth peers without an explicit
//! RFCOMM channel are looked up through [`ServiceDiscovery`] first.
//!
//! Connection setup advances through [`ConnectState`]:
//!
//! ```text
//! Start -> SdpStart -> SdpReq -> SdpDone -> AddrReady      (discovery)
//! Start -----------------------------------> AddrReady      (known channel)
//! AddrReady -> Init0 -> Init1 -> Init2 -> Connected -> End
//! ```

mod link;
pub mod packet;

pub use link::{
    LinkConnector, NoServiceDiscovery, ObexAddress, ObexStream, ServiceDiscovery, TcpConnector,
    OBEX_TCP_PORT,
};

use crate::agent::{
    AgentCore, CancelHandle, Outcome, TransportAgent, TransportMessage, TransportStatus,
};
use crate::error::{TransportError, TransportResult};
use bytes::{Bytes, BytesMut};
use packet::{opcode, read_packet, response, write_packet, Header, Packet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// OBEX target of the SyncML client service.
pub const SYNCML_TARGET: &[u8] = b"SYNCML-SYNC";

/// Largest packet this side accepts.
pub const LOCAL_MAX_PACKET: u16 = 0x2000;

/// How long `shutdown()` waits for the DISCONNECT response.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress of connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectState {
    /// Not connected.
    Start,
    /// Service discovery about to start.
    SdpStart,
    /// Service discovery query in flight.
    SdpReq,
    /// Service discovery finished.
    SdpDone,
    /// Address and channel known.
    AddrReady,
    /// Link connect in progress.
    Init0,
    /// Link established, OBEX CONNECT sent.
    Init1,
    /// OBEX CONNECT response being processed.
    Init2,
    /// Session established.
    Connected,
    /// Session ended.
    End,
}

/// An established OBEX session.
struct ObexSession {
    stream: Box<dyn ObexStream>,
    connection_id: Option<u32>,
    max_packet: usize,
}

impl ObexSession {
    fn with_connection_id(&self, mut packet: Packet) -> Packet {
        if let Some(id) = self.connection_id {
            packet.headers.insert(0, Header::ConnectionId(id));
        }
        packet
    }

    async fn request(&mut self, packet: Packet) -> TransportResult<Packet> {
        write_packet(&mut self.stream, &packet).await?;
        read_packet(&mut self.stream, false).await
    }

    /// Sends `body` in as many PUT packets as the peer's packet size needs.
    async fn put(&mut self, body: &Bytes, content_type: &str) -> TransportResult<()> {
        let mut first = self.with_connection_id(Packet::new(opcode::PUT));
        first.headers.push(Header::Type(content_type.to_string()));
        first
            .headers
            .push(Header::Length(u32::try_from(body.len()).unwrap_or(u32::MAX)));

        let mut packet = first;
        let mut offset = 0;
        loop {
            // Room left for a body header in this packet
            let room = self.max_packet.saturating_sub(packet.encoded_len() + 3).max(1);
            let end = (offset + room).min(body.len());
            let last = end == body.len();
            let chunk = body.slice(offset..end);
            offset = end;

            if last {
                packet.code = opcode::PUT_FINAL;
                packet.headers.push(Header::EndOfBody(chunk));
            } else {
                packet.headers.push(Header::Body(chunk));
            }

            let reply = self.request(packet).await?;
            match (last, reply.code) {
                (false, response::CONTINUE) => {}
                (true, response::SUCCESS) => return Ok(()),
                (_, code) => return Err(TransportError::ObexResponse { request: "PUT", code }),
            }
            packet = self.with_connection_id(Packet::new(opcode::PUT));
        }
    }

    /// Fetches the reply with GET, following CONTINUE responses.
    async fn get(&mut self, content_type: &str) -> TransportResult<TransportMessage> {
        let mut request = self
            .with_connection_id(Packet::new(opcode::GET_FINAL))
            .with(Header::Type(content_type.to_string()));
        let mut body = BytesMut::new();
        let mut reply_type = None;

        loop {
            let reply = self.request(request).await?;
            if let Some(mime) = reply.mime_type() {
                reply_type = Some(mime.to_string());
            }
            if let Some((chunk, _)) = reply.body() {
                body.extend_from_slice(chunk);
            }
            match reply.code {
                response::CONTINUE => {
                    request = self.with_connection_id(Packet::new(opcode::GET_FINAL));
                }
                response::SUCCESS => break,
                code => return Err(TransportError::ObexResponse { request: "GET", code }),
            }
        }

        Ok(TransportMessage::new(
            body.freeze(),
            reply_type.unwrap_or_else(|| content_type.to_string()),
        ))
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        let reply = self
            .request(self.with_connection_id(Packet::new(opcode::DISCONNECT)))
            .await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(TransportError::ObexResponse {
                request: "DISCONNECT",
                code: reply.code,
            })
        }
    }
}

/// Connection state that futures driven by the agent borrow mutably.
struct ObexLink {
    discovery: Box<dyn ServiceDiscovery>,
    connector: Box<dyn LinkConnector>,
    state: ConnectState,
    session: Option<ObexSession>,
}

impl ObexLink {
    async fn connect(&mut self, address: &ObexAddress) -> TransportResult<()> {
        self.state = ConnectState::Start;
        let channel = match address {
            ObexAddress::Bluetooth {
                address: device,
                channel: None,
            } => {
                self.state = ConnectState::SdpStart;
                debug!(%device, "starting service discovery");
                self.state = ConnectState::SdpReq;
                let channel = self.discovery.discover_channel(device).await?;
                self.state = ConnectState::SdpDone;
                debug!(%device, channel, "service discovery done");
                Some(channel)
            }
            ObexAddress::Bluetooth { channel, .. } => *channel,
            ObexAddress::Tcp { .. } => None,
        };
        self.state = ConnectState::AddrReady;

        self.state = ConnectState::Init0;
        let mut stream = self.connector.connect(address, channel).await?;

        self.state = ConnectState::Init1;
        let request = Packet::connect(LOCAL_MAX_PACKET).with(Header::Target(Bytes::from_static(SYNCML_TARGET)));
        write_packet(&mut stream, &request).await?;
        let reply = read_packet(&mut stream, true).await?;

        self.state = ConnectState::Init2;
        if !reply.is_success() {
            return Err(TransportError::ObexResponse {
                request: "CONNECT",
                code: reply.code,
            });
        }
        let peer_max = reply
            .connect
            .map_or(packet::MIN_PACKET_SIZE, |params| params.max_packet)
            .max(packet::MIN_PACKET_SIZE);
        let max_packet = usize::from(peer_max.min(LOCAL_MAX_PACKET));

        self.session = Some(ObexSession {
            stream,
            connection_id: reply.connection_id(),
            max_packet,
        });
        self.state = ConnectState::Connected;
        info!(%address, max_packet, "OBEX session established");
        Ok(())
    }

    async fn exchange(
        &mut self,
        address: &ObexAddress,
        message: &TransportMessage,
        no_reply: bool,
    ) -> TransportResult<Option<TransportMessage>> {
        if self.session.is_none() {
            self.connect(address).await?;
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TransportError::Connect("no OBEX session".into()))?;

        session.put(&message.data, &message.content_type).await?;
        if no_reply {
            return Ok(None);
        }
        session.get(&message.content_type).await.map(Some)
    }

    /// Drops the session without any protocol exchange.
    fn reset(&mut self) {
        if self.session.take().is_some() {
            debug!("OBEX session dropped");
        }
        self.state = ConnectState::Start;
    }
}

/// Transport agent speaking SyncML over OBEX.
pub struct ObexTransportAgent {
    core: AgentCore,
    link: ObexLink,
    address: Option<ObexAddress>,
    pending: Option<TransportMessage>,
}

impl ObexTransportAgent {
    /// Creates an agent for OBEX over TCP only.
    ///
    /// # Errors
    ///
    /// Returns an error if the I/O runtime cannot be created.
    pub fn new() -> TransportResult<Self> {
        Self::with_link(Box::new(NoServiceDiscovery), Box::new(TcpConnector))
    }

    /// Creates an agent with platform-specific discovery and link setup.
    ///
    /// # Errors
    ///
    /// Returns an error if the I/O runtime cannot be created.
    pub fn with_link(
        discovery: Box<dyn ServiceDiscovery>,
        connector: Box<dyn LinkConnector>,
    ) -> TransportResult<Self> {
        Ok(Self {
            core: AgentCore::new("obex")?,
            link: ObexLink {
                discovery,
                connector,
                state: ConnectState::Start,
                session: None,
            },
            address: None,
            pending: None,
        })
    }

    /// Returns the progress of connection establishment.
    pub fn connect_state(&self) -> ConnectState {
        self.link.state
    }

    /// Returns the parsed peer address.
    pub fn address(&self) -> Option<&ObexAddress> {
        self.address.as_ref()
    }
}

impl TransportAgent for ObexTransportAgent {
    fn set_url(&mut self, url: &str) -> TransportResult<()> {
        let address = ObexAddress::parse(url)?;
        if self.address.as_ref() != Some(&address) {
            self.link.reset();
        }
        self.address = Some(address);
        self.core.url = Some(url.to_string());
        Ok(())
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.core.content_type = content_type.to_string();
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.core.set_timeout(timeout);
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        self.core.begin_send(true, data.len())?;
        self.pending = Some(TransportMessage::new(
            Bytes::copy_from_slice(data),
            self.core.content_type.clone(),
        ));
        Ok(())
    }

    fn cancel(&mut self) {
        if self.core.cancel() {
            // No DISCONNECT round trip, the peer may be unresponsive
            self.pending = None;
            self.link.reset();
        }
    }

    fn shutdown(&mut self) {
        if let Some(session) = &mut self.link.session {
            let graceful = self
                .core
                .block_on(async { tokio::time::timeout(DISCONNECT_TIMEOUT, session.disconnect()).await });
            match graceful {
                Ok(Ok(())) => debug!("OBEX DISCONNECT acknowledged"),
                Ok(Err(err)) => warn!(error = %err, "OBEX DISCONNECT failed"),
                Err(_) => warn!("no response to OBEX DISCONNECT"),
            }
        }
        self.link.reset();
        self.link.state = ConnectState::End;
        self.pending = None;
        self.core.close();
    }

    fn wait(&mut self, no_reply: bool) -> TransportStatus {
        if self.core.status() != TransportStatus::Active {
            return self.core.status();
        }
        let (Some(message), Some(address)) = (self.pending.take(), self.address.clone()) else {
            return self.core.finish(Outcome::Failed(TransportError::NoUrl));
        };

        let link = &mut self.link;
        let outcome = self
            .core
            .drive(async move { link.exchange(&address, &message, no_reply).await });

        if !matches!(outcome, Outcome::Completed(_)) {
            // Partial exchanges leave the session in an unknown state
            self.link.reset();
        }
        self.core.finish(outcome)
    }

    fn get_reply(&self) -> TransportResult<&TransportMessage> {
        self.core.reply()
    }

    fn status(&self) -> TransportStatus {
        self.core.status()
    }

    fn last_error(&self) -> Option<&TransportError> {
        self.core.last_error()
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.core.cancel_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::content_type::SYNCML_WBXML;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use tokio::io::DuplexStream;

    /// Server behavior for one test.
    #[derive(Clone, Copy)]
    enum Peer {
        /// Echoes every PUT body back on GET, split into small chunks.
        Echo,
        /// Rejects PUT with FORBIDDEN.
        RejectPut,
        /// Connects, then never answers.
        Silent,
    }

    /// Hands out the client end of a duplex pipe whose server end is run by
    /// a fake OBEX server on its own thread.
    struct DuplexConnector {
        peer: Peer,
        connects: Arc<Mutex<u32>>,
        disconnects: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl LinkConnector for DuplexConnector {
        async fn connect(
            &self,
            _address: &ObexAddress,
            _channel: Option<u8>,
        ) -> TransportResult<Box<dyn ObexStream>> {
            *self.connects.lock() += 1;
            let (client, server) = tokio::io::duplex(4096);
            let peer = self.peer;
            let disconnects = Arc::clone(&self.disconnects);
            thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let _ = rt.block_on(serve(server, peer, disconnects));
            });
            Ok(Box::new(client))
        }
    }

    async fn serve(
        mut stream: DuplexStream,
        peer: Peer,
        disconnects: Arc<Mutex<u32>>,
    ) -> TransportResult<()> {
        let connect = read_packet(&mut stream, true).await?;
        assert_eq!(connect.code, opcode::CONNECT);
        assert_eq!(connect.target().map(|t| &t[..]), Some(SYNCML_TARGET));
        let reply = Packet {
            code: response::SUCCESS,
            connect: Some(packet::ConnectParams::new(packet::MIN_PACKET_SIZE)),
            headers: vec![Header::ConnectionId(77), Header::Who(Bytes::from_static(SYNCML_TARGET))],
        };
        write_packet(&mut stream, &reply).await?;

        let mut received = BytesMut::new();
        let mut outgoing: Option<Bytes> = None;
        loop {
            let request = read_packet(&mut stream, false).await?;
            if matches!(peer, Peer::Silent) {
                std::future::pending::<()>().await;
            }
            assert_eq!(request.connection_id(), Some(77));
            let answer = match request.code {
                opcode::PUT | opcode::PUT_FINAL if matches!(peer, Peer::RejectPut) => {
                    Packet::new(response::FORBIDDEN)
                }
                opcode::PUT => {
                    received.extend_from_slice(request.body().map_or(&[][..], |(b, _)| &b[..]));
                    Packet::new(response::CONTINUE)
                }
                opcode::PUT_FINAL => {
                    received.extend_from_slice(request.body().map_or(&[][..], |(b, _)| &b[..]));
                    outgoing = Some(std::mem::take(&mut received).freeze());
                    Packet::new(response::SUCCESS)
                }
                opcode::GET_FINAL => {
                    let mut rest = outgoing.take().unwrap_or_default();
                    let chunk = rest.split_to(rest.len().min(100));
                    if rest.is_empty() {
                        Packet::new(response::SUCCESS)
                            .with(Header::Type(SYNCML_WBXML.into()))
                            .with(Header::EndOfBody(chunk))
                    } else {
                        outgoing = Some(rest);
                        Packet::new(response::CONTINUE).with(Header::Body(chunk))
                    }
                }
                opcode::DISCONNECT => {
                    *disconnects.lock() += 1;
                    write_packet(&mut stream, &Packet::new(response::SUCCESS)).await?;
                    return Ok(());
                }
                _ => Packet::new(response::BAD_REQUEST),
            };
            write_packet(&mut stream, &answer).await?;
        }
    }

    fn agent(peer: Peer) -> (ObexTransportAgent, Arc<Mutex<u32>>, Arc<Mutex<u32>>) {
        let connects = Arc::new(Mutex::new(0));
        let disconnects = Arc::new(Mutex::new(0));
        let connector = DuplexConnector {
            peer,
            connects: Arc::clone(&connects),
            disconnects: Arc::clone(&disconnects),
        };
        let mut agent =
            ObexTransportAgent::with_link(Box::new(NoServiceDiscovery), Box::new(connector)).unwrap();
        agent.set_url("obex-bt://00:0A:95:9D:68:16+3").unwrap();
        (agent, connects, disconnects)
    }

    #[test]
    fn multi_packet_round_trip() {
        let (mut agent, connects, disconnects) = agent(Peer::Echo);
        assert_eq!(agent.connect_state(), ConnectState::Start);

        // Larger than the peer's packet size, forces PUT and GET continuation
        let message: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        agent.send(&message).unwrap();
        assert_eq!(agent.wait(false), TransportStatus::GotReply);
        assert_eq!(agent.connect_state(), ConnectState::Connected);

        let reply = agent.get_reply().unwrap();
        assert_eq!(&reply.data[..], &message[..]);
        assert_eq!(reply.content_type, SYNCML_WBXML);

        // Second message reuses the session
        agent.send(b"<second/>").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::GotReply);
        assert_eq!(&agent.get_reply().unwrap().data[..], b"<second/>");
        assert_eq!(*connects.lock(), 1);

        agent.shutdown();
        assert_eq!(agent.status(), TransportStatus::Closed);
        assert_eq!(agent.connect_state(), ConnectState::End);
        assert_eq!(*disconnects.lock(), 1);
    }

    #[test]
    fn failure_response_fails() {
        let (mut agent, _, _) = agent(Peer::RejectPut);
        agent.send(b"<msg/>").unwrap();

        assert_eq!(agent.wait(false), TransportStatus::Failed);
        assert!(matches!(
            agent.last_error(),
            Some(TransportError::ObexResponse {
                request: "PUT",
                code: response::FORBIDDEN
            })
        ));
        assert_eq!(agent.connect_state(), ConnectState::Start);
    }

    #[test]
    fn silent_peer_times_out() {
        let (mut agent, _, _) = agent(Peer::Silent);
        agent.set_timeout(Some(Duration::from_millis(200)));
        agent.send(b"<msg/>").unwrap();

        assert_eq!(agent.wait(false), TransportStatus::TimeOut);
        assert!(matches!(agent.last_error(), Some(TransportError::Timeout)));
        assert!(agent.get_reply().is_err());

        // Shutdown does not hang on a session that was already torn down
        agent.shutdown();
        assert_eq!(agent.status(), TransportStatus::Closed);
    }

    #[test]
    fn discovery_failure_fails() {
        let connects = Arc::new(Mutex::new(0));
        let connector = DuplexConnector {
            peer: Peer::Echo,
            connects: Arc::clone(&connects),
            disconnects: Arc::new(Mutex::new(0)),
        };
        let mut agent =
            ObexTransportAgent::with_link(Box::new(NoServiceDiscovery), Box::new(connector)).unwrap();
        agent.set_url("obex-bt://00:0A:95:9D:68:16").unwrap();
        agent.send(b"x").unwrap();

        assert_eq!(agent.wait(false), TransportStatus::Failed);
        assert!(matches!(agent.last_error(), Some(TransportError::Discovery(_))));
        assert_eq!(*connects.lock(), 0);
    }

    #[test]
    fn discovered_channel_is_used() {
        struct FixedChannel;

        #[async_trait]
        impl ServiceDiscovery for FixedChannel {
            async fn discover_channel(&self, _address: &str) -> TransportResult<u8> {
                Ok(9)
            }
        }

        struct ChannelRecorder(Arc<Mutex<Option<u8>>>, DuplexConnector);

        #[async_trait]
        impl LinkConnector for ChannelRecorder {
            async fn connect(
                &self,
                address: &ObexAddress,
                channel: Option<u8>,
            ) -> TransportResult<Box<dyn ObexStream>> {
                *self.0.lock() = channel;
                self.1.connect(address, channel).await
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let connector = ChannelRecorder(
            Arc::clone(&seen),
            DuplexConnector {
                peer: Peer::Echo,
                connects: Arc::new(Mutex::new(0)),
                disconnects: Arc::new(Mutex::new(0)),
            },
        );
        let mut agent = ObexTransportAgent::with_link(Box::new(FixedChannel), Box::new(connector)).unwrap();
        agent.set_url("obex-bt://00:0A:95:9D:68:16").unwrap();
        agent.send(b"x").unwrap();

        assert_eq!(agent.wait(false), TransportStatus::GotReply);
        assert_eq!(*seen.lock(), Some(9));
    }

    #[test]
    fn cancel_tears_down_without_disconnect() {
        let (mut agent, connects, disconnects) = agent(Peer::Echo);
        agent.send(b"one").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::GotReply);

        agent.send(b"two").unwrap();
        agent.cancel();
        assert_eq!(agent.wait(false), TransportStatus::Canceled);
        assert!(agent.get_reply().is_err());
        assert_eq!(agent.connect_state(), ConnectState::Start);
        assert_eq!(*disconnects.lock(), 0);

        // Next message reconnects
        agent.send(b"three").unwrap();
        assert_eq!(agent.wait(false), TransportStatus::GotReply);
        assert_eq!(*connects.lock(), 2);
    }
}
