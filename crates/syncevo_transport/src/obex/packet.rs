//! OBEX packet encoding.
//!
//! Wire layout of a packet:
//!
//! ```text
//! +--------+------------+---------------------+-----------+
//! | code   | length     | connect parameters  | headers   |
//! | 1 byte | 2 bytes BE | 4 bytes, CONNECT    | ...       |
//! +--------+------------+---------------------+-----------+
//! ```
//!
//! The length covers the whole packet. Header encoding is selected by the
//! two high bits of the header ID: Unicode text, byte sequence, one byte or
//! four bytes.

use crate::error::{TransportError, TransportResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request opcodes. The high bit marks the final packet of a request.
pub mod opcode {
    /// Establish a session.
    pub const CONNECT: u8 = 0x80;
    /// Terminate a session.
    pub const DISCONNECT: u8 = 0x81;
    /// Send an object, more packets follow.
    pub const PUT: u8 = 0x02;
    /// Send an object, last packet.
    pub const PUT_FINAL: u8 = 0x82;
    /// Fetch an object.
    pub const GET_FINAL: u8 = 0x83;
    /// Abort the current operation.
    pub const ABORT: u8 = 0xFF;
    /// Marks the final packet of a request.
    pub const FINAL_BIT: u8 = 0x80;
}

/// Response codes, always with the final bit set.
pub mod response {
    /// More packets are expected.
    pub const CONTINUE: u8 = 0x90;
    /// Request completed.
    pub const SUCCESS: u8 = 0xA0;
    /// Malformed request.
    pub const BAD_REQUEST: u8 = 0xC0;
    /// Authorization missing.
    pub const UNAUTHORIZED: u8 = 0xC1;
    /// Request refused.
    pub const FORBIDDEN: u8 = 0xC3;
    /// Target unknown.
    pub const NOT_FOUND: u8 = 0xC4;
    /// Server failure.
    pub const INTERNAL_SERVER_ERROR: u8 = 0xD0;
    /// Service temporarily unavailable.
    pub const SERVICE_UNAVAILABLE: u8 = 0xD3;
}

/// Header IDs.
pub mod header_id {
    /// Object name, Unicode text.
    pub const NAME: u8 = 0x01;
    /// MIME type, byte sequence.
    pub const TYPE: u8 = 0x42;
    /// Object length, four bytes.
    pub const LENGTH: u8 = 0xC3;
    /// Target service, byte sequence.
    pub const TARGET: u8 = 0x46;
    /// Body chunk, byte sequence.
    pub const BODY: u8 = 0x48;
    /// Last body chunk, byte sequence.
    pub const END_OF_BODY: u8 = 0x49;
    /// Service that answered a CONNECT, byte sequence.
    pub const WHO: u8 = 0x4A;
    /// Session identifier, four bytes.
    pub const CONNECTION_ID: u8 = 0xCB;
}

/// OBEX protocol version 1.0.
pub const OBEX_VERSION: u8 = 0x10;

/// Smallest packet size a peer may announce.
pub const MIN_PACKET_SIZE: u16 = 255;

/// Size of code, length and connect parameters.
const PACKET_PREFIX: usize = 3;
const CONNECT_PARAMS: usize = 4;

/// Parameters carried by CONNECT requests and their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    /// Protocol version.
    pub version: u8,
    /// Connect flags.
    pub flags: u8,
    /// Largest packet the sender can receive.
    pub max_packet: u16,
}

impl ConnectParams {
    /// Creates parameters for protocol version 1.0.
    pub fn new(max_packet: u16) -> Self {
        Self {
            version: OBEX_VERSION,
            flags: 0,
            max_packet,
        }
    }
}

/// A decoded header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Object name.
    Name(String),
    /// MIME type (sent null-terminated).
    Type(String),
    /// Total object length.
    Length(u32),
    /// Target service UUID or name.
    Target(Bytes),
    /// Body chunk.
    Body(Bytes),
    /// Last body chunk.
    EndOfBody(Bytes),
    /// Service that answered a CONNECT.
    Who(Bytes),
    /// Session identifier.
    ConnectionId(u32),
    /// Header this codec does not interpret.
    Other {
        /// Header ID.
        id: u8,
        /// Raw value without ID and length.
        value: Bytes,
    },
}

impl Header {
    /// Returns the header ID.
    pub fn id(&self) -> u8 {
        match self {
            Header::Name(_) => header_id::NAME,
            Header::Type(_) => header_id::TYPE,
            Header::Length(_) => header_id::LENGTH,
            Header::Target(_) => header_id::TARGET,
            Header::Body(_) => header_id::BODY,
            Header::EndOfBody(_) => header_id::END_OF_BODY,
            Header::Who(_) => header_id::WHO,
            Header::ConnectionId(_) => header_id::CONNECTION_ID,
            Header::Other { id, .. } => *id,
        }
    }

    /// Returns the number of bytes the encoded header occupies.
    pub fn encoded_len(&self) -> usize {
        match self {
            Header::Name(name) => 3 + (name.encode_utf16().count() + 1) * 2,
            Header::Type(mime) => 3 + mime.len() + 1,
            Header::Length(_) | Header::ConnectionId(_) => 5,
            Header::Target(value) | Header::Body(value) | Header::EndOfBody(value) | Header::Who(value) => {
                3 + value.len()
            }
            Header::Other { id, value } => match id >> 6 {
                2 => 2,
                3 => 5,
                _ => 3 + value.len(),
            },
        }
    }

    fn encode(&self, out: &mut BytesMut) -> TransportResult<()> {
        out.put_u8(self.id());
        match self {
            Header::Name(name) => {
                let units: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
                out.put_u16(header_len(units.len() * 2)?);
                for unit in units {
                    out.put_u16(unit);
                }
            }
            Header::Type(mime) => {
                out.put_u16(header_len(mime.len() + 1)?);
                out.put_slice(mime.as_bytes());
                out.put_u8(0);
            }
            Header::Length(value) | Header::ConnectionId(value) => out.put_u32(*value),
            Header::Target(value) | Header::Body(value) | Header::EndOfBody(value) | Header::Who(value) => {
                out.put_u16(header_len(value.len())?);
                out.put_slice(value);
            }
            Header::Other { id, value } => match id >> 6 {
                2 => out.put_u8(value.first().copied().unwrap_or(0)),
                3 => {
                    let mut word = [0u8; 4];
                    let n = value.len().min(4);
                    word[..n].copy_from_slice(&value[..n]);
                    out.put_slice(&word);
                }
                _ => {
                    out.put_u16(header_len(value.len())?);
                    out.put_slice(value);
                }
            },
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> TransportResult<Self> {
        if buf.is_empty() {
            return Err(protocol_error("missing header ID"));
        }
        let id = buf.get_u8();
        match id >> 6 {
            2 => {
                need(buf, 1, "one-byte header")?;
                let value = buf.split_to(1);
                Ok(Header::Other { id, value })
            }
            3 => {
                need(buf, 4, "four-byte header")?;
                let value = buf.get_u32();
                Ok(match id {
                    header_id::LENGTH => Header::Length(value),
                    header_id::CONNECTION_ID => Header::ConnectionId(value),
                    _ => Header::Other {
                        id,
                        value: Bytes::copy_from_slice(&value.to_be_bytes()),
                    },
                })
            }
            encoding => {
                need(buf, 2, "header length")?;
                let len = usize::from(buf.get_u16());
                if len < 3 {
                    return Err(protocol_error(format!("header {id:#04x} length {len} too small")));
                }
                need(buf, len - 3, "header value")?;
                let value = buf.split_to(len - 3);
                Ok(match (encoding, id) {
                    (0, header_id::NAME) => Header::Name(decode_unicode(&value)?),
                    (1, header_id::TYPE) => Header::Type(decode_ascii(&value)?),
                    (1, header_id::TARGET) => Header::Target(value),
                    (1, header_id::BODY) => Header::Body(value),
                    (1, header_id::END_OF_BODY) => Header::EndOfBody(value),
                    (1, header_id::WHO) => Header::Who(value),
                    _ => Header::Other { id, value },
                })
            }
        }
    }
}

fn decode_unicode(value: &[u8]) -> TransportResult<String> {
    if value.len() % 2 != 0 {
        return Err(protocol_error("odd length in Unicode header"));
    }
    let units: Vec<u16> = value
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|_| protocol_error("invalid UTF-16 in Unicode header"))
}

fn decode_ascii(value: &[u8]) -> TransportResult<String> {
    let text = value.strip_suffix(&[0]).unwrap_or(value);
    String::from_utf8(text.to_vec()).map_err(|_| protocol_error("invalid text in Type header"))
}

fn need(buf: &Bytes, len: usize, what: &str) -> TransportResult<()> {
    if buf.len() < len {
        Err(protocol_error(format!("truncated {what}")))
    } else {
        Ok(())
    }
}

/// Length field of a variable-size header with `payload` bytes of data.
fn header_len(payload: usize) -> TransportResult<u16> {
    u16::try_from(3 + payload)
        .map_err(|_| protocol_error(format!("header with {payload} bytes of data too large")))
}

fn protocol_error(message: impl Into<String>) -> TransportError {
    TransportError::ObexProtocol(message.into())
}

/// A request or response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Opcode or response code.
    pub code: u8,
    /// Connect parameters of CONNECT requests and their responses.
    pub connect: Option<ConnectParams>,
    /// Headers in wire order.
    pub headers: Vec<Header>,
}

impl Packet {
    /// Creates a packet without headers.
    pub fn new(code: u8) -> Self {
        Self {
            code,
            connect: None,
            headers: Vec::new(),
        }
    }

    /// Creates a CONNECT request.
    pub fn connect(max_packet: u16) -> Self {
        Self {
            code: opcode::CONNECT,
            connect: Some(ConnectParams::new(max_packet)),
            headers: Vec::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Returns true for responses with the final bit and a success class.
    pub fn is_success(&self) -> bool {
        self.code == response::SUCCESS
    }

    /// Returns the encoded size.
    pub fn encoded_len(&self) -> usize {
        PACKET_PREFIX
            + self.connect.map_or(0, |_| CONNECT_PARAMS)
            + self.headers.iter().map(Header::encoded_len).sum::<usize>()
    }

    /// Returns the connection ID header, if present.
    pub fn connection_id(&self) -> Option<u32> {
        self.headers.iter().find_map(|header| match header {
            Header::ConnectionId(id) => Some(*id),
            _ => None,
        })
    }

    /// Returns the Type header, if present.
    pub fn mime_type(&self) -> Option<&str> {
        self.headers.iter().find_map(|header| match header {
            Header::Type(mime) => Some(mime.as_str()),
            _ => None,
        })
    }

    /// Returns the Target header, if present.
    pub fn target(&self) -> Option<&Bytes> {
        self.headers.iter().find_map(|header| match header {
            Header::Target(target) => Some(target),
            _ => None,
        })
    }

    /// Returns the body chunk and whether it was the last one.
    pub fn body(&self) -> Option<(&Bytes, bool)> {
        self.headers.iter().find_map(|header| match header {
            Header::Body(chunk) => Some((chunk, false)),
            Header::EndOfBody(chunk) => Some((chunk, true)),
            _ => None,
        })
    }

    /// Encodes the packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet exceeds the 16 bit length field.
    pub fn encode(&self) -> TransportResult<Bytes> {
        let len = self.encoded_len();
        let wire_len = u16::try_from(len)
            .map_err(|_| protocol_error(format!("packet of {len} bytes too large")))?;

        let mut out = BytesMut::with_capacity(len);
        out.put_u8(self.code);
        out.put_u16(wire_len);
        if let Some(params) = self.connect {
            out.put_u8(params.version);
            out.put_u8(params.flags);
            out.put_u16(params.max_packet);
        }
        for header in &self.headers {
            header.encode(&mut out)?;
        }
        Ok(out.freeze())
    }

    /// Decodes one complete packet.
    ///
    /// `with_connect` must be true for CONNECT requests and the responses to
    /// them, which carry connect parameters before the headers.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated or inconsistent packets.
    pub fn decode(mut buf: Bytes, with_connect: bool) -> TransportResult<Self> {
        need(&buf, PACKET_PREFIX, "packet header")?;
        let code = buf.get_u8();
        let len = usize::from(buf.get_u16());
        if len != buf.len() + PACKET_PREFIX {
            return Err(protocol_error(format!(
                "packet length {len} does not match {} received bytes",
                buf.len() + PACKET_PREFIX
            )));
        }

        let connect = if with_connect {
            need(&buf, CONNECT_PARAMS, "connect parameters")?;
            Some(ConnectParams {
                version: buf.get_u8(),
                flags: buf.get_u8(),
                max_packet: buf.get_u16(),
            })
        } else {
            None
        };

        let mut headers = Vec::new();
        while !buf.is_empty() {
            headers.push(Header::decode(&mut buf)?);
        }
        Ok(Self {
            code,
            connect,
            headers,
        })
    }
}

/// Writes one packet.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = packet.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one packet.
///
/// # Errors
///
/// Returns an error if the stream ends or the packet is malformed.
pub async fn read_packet<R>(reader: &mut R, with_connect: bool) -> TransportResult<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; PACKET_PREFIX];
    reader.read_exact(&mut prefix).await?;
    let len = usize::from(u16::from_be_bytes([prefix[1], prefix[2]]));
    if len < PACKET_PREFIX {
        return Err(protocol_error(format!("packet length {len} too small")));
    }

    let mut raw = BytesMut::with_capacity(len);
    raw.put_slice(&prefix);
    raw.resize(len, 0);
    reader.read_exact(&mut raw[PACKET_PREFIX..]).await?;
    Packet::decode(raw.freeze(), with_connect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout() {
        let packet = Packet::connect(0x2000).with(Header::Target(Bytes::from_static(b"SYNCML-SYNC")));
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes[0], opcode::CONNECT);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, bytes.len());
        assert_eq!(&bytes[3..7], &[OBEX_VERSION, 0, 0x20, 0x00]);
        assert_eq!(bytes[7], header_id::TARGET);
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 3 + 11);
        assert_eq!(&bytes[10..], b"SYNCML-SYNC");

        assert_eq!(Packet::decode(bytes, true).unwrap(), packet);
    }

    #[test]
    fn header_encodings() {
        let packet = Packet::new(opcode::PUT)
            .with(Header::ConnectionId(0xDEADBEEF))
            .with(Header::Name("sync ü".into()))
            .with(Header::Type("application/vnd.syncml+xml".into()))
            .with(Header::Length(42))
            .with(Header::Body(Bytes::from_static(b"<SyncML>")))
            .with(Header::Other {
                id: 0x97,
                value: Bytes::from_static(&[7]),
            });
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), packet.encoded_len());

        let decoded = Packet::decode(bytes, false).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.connection_id(), Some(0xDEADBEEF));
        assert_eq!(decoded.mime_type(), Some("application/vnd.syncml+xml"));
        assert_eq!(decoded.body().map(|(chunk, last)| (chunk.len(), last)), Some((8, false)));
    }

    #[test]
    fn type_header_is_null_terminated() {
        let bytes = Packet::new(opcode::GET_FINAL)
            .with(Header::Type("a/b".into()))
            .encode()
            .unwrap();
        assert_eq!(&bytes[3..], &[header_id::TYPE, 0, 7, b'a', b'/', b'b', 0]);
    }

    #[test]
    fn truncated_packets_rejected() {
        assert!(Packet::decode(Bytes::from_static(&[0xA0, 0x00]), false).is_err());
        // Length field claims more than present
        assert!(Packet::decode(Bytes::from_static(&[0xA0, 0x00, 0x09, 0x48]), false).is_err());
        // Header length runs past the end
        assert!(Packet::decode(
            Bytes::from_static(&[0xA0, 0x00, 0x07, 0x48, 0x00, 0x09, 0x41]),
            false
        )
        .is_err());
    }

    #[test]
    fn oversized_packet_rejected() {
        let packet = Packet::new(opcode::PUT).with(Header::Body(Bytes::from(vec![0u8; 70_000])));
        assert!(matches!(packet.encode(), Err(TransportError::ObexProtocol(_))));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut out = BytesMut::new();
        let header = Header::Body(Bytes::from(vec![0u8; 65_533]));
        assert!(matches!(header.encode(&mut out), Err(TransportError::ObexProtocol(_))));

        let mut out = BytesMut::new();
        Header::Body(Bytes::from(vec![0u8; 65_532])).encode(&mut out).unwrap();
        assert_eq!(&out[1..3], &[0xFF, 0xFF]);

        let name = Header::Name("x".repeat(40_000));
        assert!(name.encode(&mut BytesMut::new()).is_err());
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let sent = Packet::new(response::SUCCESS)
            .with(Header::EndOfBody(Bytes::from(vec![9u8; 300])));

        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move { write_packet(&mut server, &sent).await })
        };
        let received = read_packet(&mut client, false).await.unwrap();
        writer.await.unwrap().unwrap();

        assert_eq!(received, sent);
        assert!(received.is_success());
    }
}
