//! PAW P2P handshake protocol.
//!
//! The handshake is sent as raw bytes (no framing) right after the transport
//! connects. Format, 65 bytes total:
//! - Protocol version (1 byte)
//! - Chain identifier (32 bytes, zero-padded, longer values truncated)
//! - Node identifier (32 bytes, zero-padded, longer values truncated)
//!
//! The initiator writes first and then reads; the responder reads, validates,
//! and only replies if the initiator is acceptable.

use crate::{NetworkError, NetworkResult, PeerId, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Width of each identity field.
pub const IDENTITY_FIELD_SIZE: usize = crate::peer::WIRE_ID_LEN;

/// Total handshake size.
pub const HANDSHAKE_SIZE: usize = 1 + 2 * IDENTITY_FIELD_SIZE;

/// Zero-pad or truncate an identifier to the fixed field width.
fn pad_identity(value: &str) -> [u8; IDENTITY_FIELD_SIZE] {
    let mut field = [0u8; IDENTITY_FIELD_SIZE];
    let bytes = value.as_bytes();
    let len = bytes.len().min(IDENTITY_FIELD_SIZE);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Field contents with trailing zero padding removed.
fn unpad(field: &[u8; IDENTITY_FIELD_SIZE]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    &field[..end]
}

/// Handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub chain_id: [u8; IDENTITY_FIELD_SIZE],
    pub node_id: [u8; IDENTITY_FIELD_SIZE],
}

impl Handshake {
    /// Build the local handshake at the current protocol version.
    pub fn new(chain_id: &str, node_id: &str) -> Self {
        Self::with_version(PROTOCOL_VERSION, chain_id, node_id)
    }

    pub fn with_version(version: u8, chain_id: &str, node_id: &str) -> Self {
        Self {
            version,
            chain_id: pad_identity(chain_id),
            node_id: pad_identity(node_id),
        }
    }

    /// Serialize to the fixed wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[0] = self.version;
        buf[1..1 + IDENTITY_FIELD_SIZE].copy_from_slice(&self.chain_id);
        buf[1 + IDENTITY_FIELD_SIZE..].copy_from_slice(&self.node_id);
        buf
    }

    /// Parse the fixed wire form. Any 65 bytes parse; validation is separate.
    pub fn parse(buf: &[u8; HANDSHAKE_SIZE]) -> Self {
        let mut chain_id = [0u8; IDENTITY_FIELD_SIZE];
        let mut node_id = [0u8; IDENTITY_FIELD_SIZE];
        chain_id.copy_from_slice(&buf[1..1 + IDENTITY_FIELD_SIZE]);
        node_id.copy_from_slice(&buf[1 + IDENTITY_FIELD_SIZE..]);
        Self {
            version: buf[0],
            chain_id,
            node_id,
        }
    }

    /// Chain identifier as text (lossy for non-UTF-8 input).
    pub fn chain_id_string(&self) -> String {
        String::from_utf8_lossy(unpad(&self.chain_id)).into_owned()
    }

    /// Node identifier as text (lossy for non-UTF-8 input).
    pub fn node_id_string(&self) -> String {
        String::from_utf8_lossy(unpad(&self.node_id)).into_owned()
    }

    /// Check a remote handshake against ours.
    ///
    /// `expected` is the identifier the dialer believes it is talking to, if any.
    pub fn validate_remote(&self, remote: &Handshake, expected: Option<&PeerId>) -> NetworkResult<()> {
        if remote.version != self.version {
            return Err(NetworkError::ProtocolVersionMismatch {
                expected: self.version,
                got: remote.version,
            });
        }
        if remote.chain_id != self.chain_id {
            return Err(NetworkError::ChainIdMismatch {
                expected: self.chain_id_string(),
                got: remote.chain_id_string(),
            });
        }
        if unpad(&remote.node_id).is_empty() {
            return Err(NetworkError::InvalidFormat("empty node id in handshake".into()));
        }
        if let Some(expected) = expected {
            // Compare in truncated form; ids longer than the field cannot round-trip.
            if pad_identity(expected.as_str()) != remote.node_id {
                return Err(NetworkError::IdentityMismatch {
                    expected: expected.to_string(),
                    got: remote.node_id_string(),
                });
            }
        }
        Ok(())
    }
}

/// What we learned about the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub peer_id: PeerId,
    pub version: u8,
    pub chain_id: String,
}

impl HandshakeOutcome {
    fn from_remote(remote: &Handshake) -> Self {
        Self {
            peer_id: PeerId::new(remote.node_id_string()),
            version: remote.version,
            chain_id: remote.chain_id_string(),
        }
    }
}

async fn read_handshake<R: AsyncRead + Unpin>(stream: &mut R) -> NetworkResult<Handshake> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::Io(e)
        }
    })?;
    Ok(Handshake::parse(&buf))
}

async fn write_handshake<W: AsyncWrite + Unpin>(stream: &mut W, local: &Handshake) -> NetworkResult<()> {
    let bytes = local.serialize();
    debug!(hex = %hex::encode(&bytes[..1 + IDENTITY_FIELD_SIZE]), "Sending handshake");
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the initiator side: send, then read and validate the reply.
#[instrument(skip(stream, local, expected), fields(expected = ?expected.map(|p| p.as_str())))]
pub async fn initiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local: &Handshake,
    expected: Option<&PeerId>,
    timeout: Duration,
) -> NetworkResult<HandshakeOutcome> {
    let exchange = async {
        write_handshake(stream, local).await?;
        let remote = read_handshake(stream).await?;
        local.validate_remote(&remote, expected)?;
        Ok::<_, NetworkError>(HandshakeOutcome::from_remote(&remote))
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)?
}

/// Run the responder side: read and validate, then reply.
///
/// Nothing is written back when the initiator is rejected.
#[instrument(skip(stream, local))]
pub async fn respond<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local: &Handshake,
    timeout: Duration,
) -> NetworkResult<HandshakeOutcome> {
    let exchange = async {
        let remote = read_handshake(stream).await?;
        local.validate_remote(&remote, None)?;
        write_handshake(stream, local).await?;
        Ok::<_, NetworkError>(HandshakeOutcome::from_remote(&remote))
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)?
}
