//! Source engine RCON over TCP.
//!
//! Framing: `[size i32 LE][id i32 LE][type i32 LE][body ASCII][0x00][0x00]`,
//! where `size` counts everything after the size field itself, so
//! `size = 4 + 4 + body.len() + 2`. Authentication is a type-3 packet
//! answered by a type-2 packet whose id echoes the request; an id of `-1`
//! signals rejected credentials.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::{Error, Result, Timeouts};

pub const PACKET_AUTH: i32 = 3;
pub const PACKET_EXECCOMMAND: i32 = 2;
pub const PACKET_AUTH_RESPONSE: i32 = 2;
pub const PACKET_RESPONSE_VALUE: i32 = 0;

// id + type + two body terminators
const PACKET_OVERHEAD: usize = 10;
// the engine caps bodies at 4096 bytes
const MAX_PACKET_SIZE: i32 = PACKET_OVERHEAD as i32 + 4096;
const AUTH_FAILED_ID: i32 = -1;

/// One wire packet. `kind` is the raw type field: request and response
/// types overlap numerically (EXECCOMMAND and AUTH_RESPONSE are both 2),
/// so which one `2` means depends on direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    /// Wire size as carried in the size prefix.
    pub fn wire_size(&self) -> i32 {
        (PACKET_OVERHEAD + self.body.len()) as i32
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + PACKET_OVERHEAD + self.body.len());
        frame.extend_from_slice(&self.wire_size().to_le_bytes());
        frame.extend_from_slice(&self.id.to_le_bytes());
        frame.extend_from_slice(&self.kind.to_le_bytes());
        frame.extend_from_slice(self.body.as_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame
    }

    /// Reads exactly one packet. The size prefix tells how many bytes the
    /// packet still owes; `read_exact` keeps collecting until the whole
    /// frame arrived, so a partial TCP read never yields a torn packet.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf).await?;
        let size = i32::from_le_bytes(size_buf);
        if !(PACKET_OVERHEAD as i32..=MAX_PACKET_SIZE).contains(&size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("implausible packet size {}", size),
            ));
        }

        let mut frame = vec![0u8; size as usize];
        reader.read_exact(&mut frame).await?;

        let id = i32::from_le_bytes(frame[0..4].try_into().expect("4-byte slice"));
        let kind = i32::from_le_bytes(frame[4..8].try_into().expect("4-byte slice"));
        let body_bytes = &frame[8..frame.len() - 2];
        let body = std::str::from_utf8(body_bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-ascii packet body"))?
            .to_owned();

        Ok(Self { id, kind, body })
    }

    pub fn is_auth_rejection(&self) -> bool {
        self.id == AUTH_FAILED_ID
    }
}

/// Source engine RCON client over TCP.
///
/// Responses are single-packet: commands whose output spans multiple
/// RESPONSE_VALUE packets truncate at the first one.
pub struct SourceConnection {
    io: TcpStream,
    next_id: i32,
    timeouts: Timeouts,
    connected: bool,
}

impl SourceConnection {
    pub async fn connect(
        address: &str,
        port: u16,
        password: &str,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let endpoint = format!("{}:{}", address, port);
        let io = match timeout(timeouts.connect, TcpStream::connect(&endpoint)).await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => return Err(Error::ConnectionFailed(format!("{}: {}", endpoint, e))),
            Err(_) => return Err(Error::Timeout(timeouts.connect)),
        };

        let mut conn = Self {
            io,
            next_id: 1,
            timeouts,
            connected: false,
        };

        conn.auth(password).await?;
        conn.connected = true;
        trace!("RCON connected to {}", endpoint);

        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Executes one command and resolves to the body of the matching
    /// RESPONSE_VALUE packet.
    pub async fn execute(&mut self, command: &str) -> Result<String> {
        if command.trim().is_empty() {
            return Err(Error::CommandFailed("empty command".into()));
        }
        if !self.connected {
            return Err(Error::NotConnected);
        }

        let request_id = match self.send(PACKET_EXECCOMMAND, command).await {
            Ok(id) => id,
            Err(e) => {
                self.connected = false;
                return Err(Error::ConnectionFailed(e.to_string()));
            }
        };

        match timeout(self.timeouts.command, self.receive_response(request_id)).await {
            Ok(Ok(body)) => {
                trace!("Request {} answered with {} bytes", request_id, body.len());
                Ok(body)
            }
            Ok(Err(e)) => {
                self.connected = false;
                Err(e)
            }
            Err(_) => Err(Error::Timeout(self.timeouts.command)),
        }
    }

    pub async fn disconnect(&mut self) {
        self.connected = false;
        let _ = self.io.shutdown().await;
    }

    async fn receive_response(&mut self, request_id: i32) -> Result<String> {
        loop {
            let packet = Packet::read_from(&mut self.io).await.map_err(map_read_error)?;
            if packet.kind == PACKET_RESPONSE_VALUE && packet.id == request_id {
                return Ok(packet.body);
            }
            // stale replies to earlier timed-out requests land here
            trace!(
                "Skipping packet id {} type {} while waiting for {}",
                packet.id,
                packet.kind,
                request_id
            );
        }
    }

    async fn auth(&mut self, password: &str) -> Result<()> {
        let auth_id = self
            .send(PACKET_AUTH, password)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let reply = match timeout(self.timeouts.connect, async {
            // some servers preface the auth reply with an empty
            // RESPONSE_VALUE; anything that is not type 2 is not the answer
            loop {
                let packet = Packet::read_from(&mut self.io).await?;
                if packet.kind == PACKET_AUTH_RESPONSE {
                    break Ok::<Packet, io::Error>(packet);
                }
            }
        })
        .await
        {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => return Err(map_read_error(e)),
            Err(_) => return Err(Error::Timeout(self.timeouts.connect)),
        };

        if reply.is_auth_rejection() {
            Err(Error::AuthFailed)
        } else if reply.id != auth_id {
            Err(Error::InvalidResponse(format!(
                "auth response id {} does not match request id {}",
                reply.id, auth_id
            )))
        } else {
            Ok(())
        }
    }

    async fn send(&mut self, kind: i32, body: &str) -> io::Result<i32> {
        let id = self.take_id();
        let packet = Packet::new(id, kind, body);
        self.io.write_all(&packet.encode()).await?;
        Ok(id)
    }

    fn take_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = next_packet_id(self.next_id);
        id
    }
}

/// Ids stay strictly positive: `-1` is the auth-failure sentinel, and the
/// counter wraps back to 1 before reaching `i32::MAX`.
fn next_packet_id(current: i32) -> i32 {
    if current >= i32::MAX - 1 {
        1
    } else {
        current + 1
    }
}

fn map_read_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData => Error::InvalidResponse(e.to_string()),
        _ => Error::ConnectionFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn packet_round_trip() {
        let packet = Packet::new(7, PACKET_EXECCOMMAND, "status");
        let frame = packet.encode();

        // size excludes the size field itself: id + type + body + two nulls
        assert_eq!(packet.wire_size(), 4 + 4 + 6 + 2);
        assert_eq!(frame.len(), packet.wire_size() as usize + 4);
        assert_eq!(&frame[0..4], &16i32.to_le_bytes());

        let parsed = Packet::read_from(&mut Cursor::new(frame)).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn packet_round_trip_empty_body() {
        let packet = Packet::new(1, PACKET_RESPONSE_VALUE, "");
        assert_eq!(packet.wire_size(), 10);

        let parsed = Packet::read_from(&mut Cursor::new(packet.encode()))
            .await
            .unwrap();
        assert_eq!(parsed.body, "");
        assert_eq!(parsed.kind, PACKET_RESPONSE_VALUE);
    }

    #[tokio::test]
    async fn implausible_size_prefix_is_invalid_data() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&3i32.to_le_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        let err = Packet::read_from(&mut Cursor::new(frame)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    async fn read_frame(stream: &mut tokio::net::TcpStream) -> (i32, i32, Vec<u8>) {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let length = i32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; length];
        stream.read_exact(&mut rest).await.unwrap();
        let id = i32::from_le_bytes(rest[0..4].try_into().unwrap());
        let ptype = i32::from_le_bytes(rest[4..8].try_into().unwrap());
        (id, ptype, rest[8..].to_vec())
    }

    async fn write_frame(stream: &mut tokio::net::TcpStream, id: i32, ptype: i32, body: &str) {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(10 + body.len() as i32).to_le_bytes());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&ptype.to_le_bytes());
        buf.extend_from_slice(body.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        stream.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn auth_success_then_execute() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (auth_id, ptype, body) = read_frame(&mut stream).await;
            assert_eq!(ptype, PACKET_AUTH);
            assert_eq!(&body[..body.len() - 2], b"pw");
            write_frame(&mut stream, auth_id, PACKET_AUTH_RESPONSE, "").await;

            let (cmd_id, ptype, body) = read_frame(&mut stream).await;
            assert_eq!(ptype, PACKET_EXECCOMMAND);
            // body carries the command plus the two trailing nulls
            assert_eq!(body, b"status\0\0");
            write_frame(&mut stream, cmd_id, PACKET_RESPONSE_VALUE, "hostname: test").await;
        });

        let mut conn = SourceConnection::connect(
            &addr.ip().to_string(),
            addr.port(),
            "pw",
            Timeouts::default(),
        )
        .await
        .unwrap();
        assert!(conn.is_connected());

        let body = conn.execute("status").await.unwrap();
        assert_eq!(body, "hostname: test");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn auth_failure_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, ptype, _) = read_frame(&mut stream).await;
            assert_eq!(ptype, PACKET_AUTH);
            write_frame(&mut stream, -1, PACKET_AUTH_RESPONSE, "").await;
        });

        let result = SourceConnection::connect(
            &addr.ip().to_string(),
            addr.port(),
            "wrong",
            Timeouts::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::AuthFailed)));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_command_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (auth_id, _, _) = read_frame(&mut stream).await;
            write_frame(&mut stream, auth_id, PACKET_AUTH_RESPONSE, "").await;
            // hold the connection open while the client checks its input
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let mut conn = SourceConnection::connect(
            &addr.ip().to_string(),
            addr.port(),
            "pw",
            Timeouts::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            conn.execute("   ").await,
            Err(Error::CommandFailed(_))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn command_timeout_when_server_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (auth_id, _, _) = read_frame(&mut stream).await;
            write_frame(&mut stream, auth_id, PACKET_AUTH_RESPONSE, "").await;
            let _ = read_frame(&mut stream).await;
            // never answer the command
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let timeouts = Timeouts {
            connect: Duration::from_secs(5),
            command: Duration::from_millis(100),
        };
        let mut conn =
            SourceConnection::connect(&addr.ip().to_string(), addr.port(), "pw", timeouts)
                .await
                .unwrap();

        assert!(matches!(
            conn.execute("status").await,
            Err(Error::Timeout(_))
        ));
        server.abort();
    }

    #[tokio::test]
    async fn connection_refused_surfaces_connection_failed() {
        // bind-then-drop to get a port with no listener
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SourceConnection::connect(
            &addr.ip().to_string(),
            addr.port(),
            "pw",
            Timeouts::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::ConnectionFailed(_))));
    }

    #[test]
    fn ids_stay_positive_across_wraparound() {
        assert_eq!(next_packet_id(1), 2);
        assert_eq!(next_packet_id(i32::MAX - 2), i32::MAX - 1);
        assert_eq!(next_packet_id(i32::MAX - 1), 1);
        assert_eq!(next_packet_id(i32::MAX), 1);
    }
}
