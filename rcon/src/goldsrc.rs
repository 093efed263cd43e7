//! GoldSource engine RCON over UDP.
//!
//! Every exchange is challenge-prefixed: the client first asks the server
//! for a challenge token, then echoes it in each `rcon` line. Replies may
//! arrive split across datagrams and are reassembled before returning.

use std::collections::BTreeMap;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

use crate::{Error, Result, Timeouts};

const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFE];
// response datagrams carry a one-byte legacy type after the header
const RESPONSE_TYPE_LEGACY: u8 = 0x6C;

const CHALLENGE_REQUEST: &[u8] = b"\xFF\xFF\xFF\xFFchallenge rcon\n";
const CHALLENGE_REPLY_PREFIX: &str = "challenge rcon";

const MAX_DATAGRAM: usize = 65_507;

/// Single-socket GoldSource RCON client holding at most one challenge at
/// a time. The challenge is refreshed on connect and dropped on disconnect.
pub struct GoldSrcConnection {
    socket: Option<UdpSocket>,
    password: String,
    challenge: Option<String>,
    timeouts: Timeouts,
}

impl GoldSrcConnection {
    pub async fn connect(
        address: &str,
        port: u16,
        password: &str,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let endpoint = format!("{}:{}", address, port);
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        socket
            .connect(&endpoint)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", endpoint, e)))?;

        let mut conn = Self {
            socket: Some(socket),
            password: password.to_owned(),
            challenge: None,
            timeouts,
        };

        conn.refresh_challenge().await?;
        trace!("RCON challenge obtained from {}", endpoint);

        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some() && self.challenge.is_some()
    }

    /// Executes one command. The wire body is always
    /// `rcon <challenge> <password> <command>\n` with the command trimmed
    /// and no escaping applied.
    pub async fn execute(&mut self, command: &str) -> Result<String> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::CommandFailed("empty command".into()));
        }

        let challenge = self.challenge.as_ref().ok_or(Error::NotConnected)?;
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;

        let mut datagram = Vec::with_capacity(command.len() + 64);
        datagram.extend_from_slice(&HEADER);
        datagram.extend_from_slice(
            format!("rcon {} {} {}\n", challenge, self.password, command).as_bytes(),
        );

        socket
            .send(&datagram)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        match timeout(self.timeouts.command, collect_response(socket)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                // a failed receive invalidates the socket and the challenge
                self.socket = None;
                self.challenge = None;
                Err(e)
            }
            Err(_) => Err(Error::Timeout(self.timeouts.command)),
        }
    }

    pub async fn disconnect(&mut self) {
        self.socket = None;
        self.challenge = None;
    }

    async fn refresh_challenge(&mut self) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;

        socket
            .send(CHALLENGE_REQUEST)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = match timeout(self.timeouts.connect, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => return Err(Error::ConnectionFailed(e.to_string())),
            Err(_) => return Err(Error::Timeout(self.timeouts.connect)),
        };

        let challenge = parse_challenge(&buf[..len])?;
        self.challenge = Some(challenge);
        Ok(())
    }
}

fn parse_challenge(datagram: &[u8]) -> Result<String> {
    let payload = datagram
        .strip_prefix(&HEADER[..])
        .ok_or_else(|| Error::InvalidResponse("challenge reply missing header".into()))?;
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_matches(|c| c == '\0' || c == '\n' || c == ' ');

    let digits = text
        .strip_prefix(CHALLENGE_REPLY_PREFIX)
        .map(str::trim)
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| Error::InvalidResponse(format!("unexpected challenge reply: {}", text)))?;

    Ok(digits.to_owned())
}

/// Receives datagrams until a complete reply is assembled. Split replies
/// (`FF FF FF FE`) carry a 4-byte sequence id and a count byte whose upper
/// nibble is the fragment index and lower nibble the fragment total; they
/// are stitched in index order once all fragments for one sequence arrived.
/// The caller's command timeout bounds the whole collection.
async fn collect_response(socket: &UdpSocket) -> Result<String> {
    let mut fragments: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    let mut sequence: Option<i32> = None;
    let mut total = 0u8;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let len = socket
            .recv(&mut buf)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let datagram = &buf[..len];

        if let Some(payload) = datagram.strip_prefix(&HEADER[..]) {
            return Ok(decode_payload(payload));
        }

        let Some(split) = datagram.strip_prefix(&SPLIT_HEADER[..]) else {
            return Err(Error::InvalidResponse("unrecognized datagram header".into()));
        };
        if split.len() < 5 {
            return Err(Error::InvalidResponse("truncated split fragment".into()));
        }

        let seq = i32::from_le_bytes(split[0..4].try_into().expect("4-byte slice"));
        let index = split[4] >> 4;
        let count = split[4] & 0x0F;
        if count == 0 || index >= count {
            return Err(Error::InvalidResponse(format!(
                "bad fragment numbering {}/{}",
                index, count
            )));
        }

        // a new sequence id obsoletes any partial set we were holding
        if sequence != Some(seq) {
            fragments.clear();
            sequence = Some(seq);
            total = count;
        }
        fragments.insert(index, split[5..].to_vec());
        trace!("Fragment {}/{} for sequence {}", index + 1, total, seq);

        if fragments.len() == total as usize {
            let mut assembled = Vec::new();
            for chunk in fragments.values() {
                assembled.extend_from_slice(chunk);
            }
            let payload = assembled
                .strip_prefix(&HEADER[..])
                .map(<[u8]>::to_vec)
                .unwrap_or(assembled);
            return Ok(decode_payload(&payload));
        }
    }
}

fn decode_payload(payload: &[u8]) -> String {
    let payload = payload
        .strip_prefix(&[RESPONSE_TYPE_LEGACY][..])
        .unwrap_or(payload);
    String::from_utf8_lossy(payload)
        .trim_matches('\0')
        .to_owned()
}
