//! PROXY protocol header decoding and encoding.
//!
//! The physical proxy socket sits behind a load balancer that prepends a
//! PROXY header to every connection. The header's destination port selects
//! the virtual listener.
//!
//! Wire formats (HAProxy PROXY protocol):
//! - v1: `PROXY TCP4|TCP6 <src ip> <dst ip> <src port> <dst port>\r\n`,
//!   at most 107 bytes including the CRLF
//! - v2: 12 bytes signature, 1 byte version/command, 1 byte family/protocol,
//!   2 bytes address length, then the address block and optional TLVs
//!
//! Decoding never reads past the end of the header. The connection is later
//! handed to a worker, whose first read must be the client's first byte.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

use crate::error::ConfigError;

/// PROXY protocol v2 signature (12 bytes).
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Longest valid v1 header, CRLF included.
pub const V1_MAX_LEN: usize = 107;

const V1_PREFIX: &[u8] = b"PROXY ";

/// Fixed part of a v2 header: signature, version/command, family, length.
const V2_FIXED_LEN: usize = 16;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

const COMMAND_LOCAL: u8 = 0x0;
const COMMAND_PROXY: u8 = 0x1;

const AF_UNSPEC: u8 = 0x00;
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;

const TRANSPORT_STREAM: u8 = 0x01;

/// IPv4 address block (4 + 4 + 2 + 2 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// IPv6 address block (16 + 16 + 2 + 2 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Largest v2 address block (addresses plus TLVs) accepted. The wire
/// allows 65535; a stream decoder would have to buffer all of it.
pub const V2_MAX_ADDR_LEN: usize = 1024;

/// PROXY protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyVersion {
    #[default]
    V1,
    V2,
}

impl FromStr for ProxyVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(ProxyVersion::V1),
            "v2" | "2" => Ok(ProxyVersion::V2),
            _ => Err(ConfigError::ProxyVersion(s.to_string())),
        }
    }
}

impl std::fmt::Display for ProxyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyVersion::V1 => write!(f, "v1"),
            ProxyVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Header decoding errors. Any of these closes the connection.
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("timed out waiting for PROXY header")]
    Timeout,

    #[error("connection closed inside PROXY header")]
    Truncated,

    #[error("missing PROXY signature")]
    BadSignature,

    #[error("malformed PROXY header: {0}")]
    Malformed(String),

    /// Well-formed, but carries no destination to route by.
    #[error("unsupported PROXY header: {0}")]
    Unsupported(&'static str),

    #[error("io error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ProxyHeaderError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProxyHeaderError::Truncated
        } else {
            ProxyHeaderError::Io(err)
        }
    }
}

/// Addresses carried by a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination address as seen by the load balancer.
    pub dst_addr: SocketAddr,
}

enum Family {
    V4(Ipv4Addr, Ipv4Addr),
    V6(Ipv6Addr, Ipv6Addr),
}

impl ProxyHeader {
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Port the connection was addressed to (the virtual port).
    pub fn destination_port(&self) -> u16 {
        self.dst_addr.port()
    }

    // Both addresses must share a family on the wire. Mixed pairs use v4
    // when the v6 side is v4-mapped and v6 otherwise.
    fn family(&self) -> Family {
        match (self.src_addr.ip(), self.dst_addr.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Family::V4(src, dst),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Family::V6(src, dst),
            (IpAddr::V4(src), IpAddr::V6(dst)) => match dst.to_ipv4_mapped() {
                Some(dst) => Family::V4(src, dst),
                None => Family::V6(src.to_ipv6_mapped(), dst),
            },
            (IpAddr::V6(src), IpAddr::V4(dst)) => match src.to_ipv4_mapped() {
                Some(src) => Family::V4(src, dst),
                None => Family::V6(src, dst.to_ipv6_mapped()),
            },
        }
    }

    /// Encode in the given version.
    pub fn encode(&self, version: ProxyVersion) -> io::Result<Vec<u8>> {
        match version {
            ProxyVersion::V1 => Ok(self.encode_v1()),
            ProxyVersion::V2 => self.encode_v2(),
        }
    }

    /// Encode as a v1 text line.
    pub fn encode_v1(&self) -> Vec<u8> {
        let (proto, src, dst) = match self.family() {
            Family::V4(src, dst) => ("TCP4", IpAddr::V4(src), IpAddr::V4(dst)),
            Family::V6(src, dst) => ("TCP6", IpAddr::V6(src), IpAddr::V6(dst)),
        };
        format!(
            "PROXY {} {} {} {} {}\r\n",
            proto,
            src,
            dst,
            self.src_addr.port(),
            self.dst_addr.port()
        )
        .into_bytes()
    }

    /// Encode as a v2 binary header without TLVs.
    pub fn encode_v2(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(V2_FIXED_LEN + IPV6_ADDR_LEN as usize);
        buf.write_all(&V2_SIGNATURE)?;
        buf.push(VERSION_COMMAND_PROXY);

        match self.family() {
            Family::V4(src, dst) => {
                buf.push(AF_INET | TRANSPORT_STREAM);
                buf.write_all(&IPV4_ADDR_LEN.to_be_bytes())?;
                buf.write_all(&src.octets())?;
                buf.write_all(&dst.octets())?;
            }
            Family::V6(src, dst) => {
                buf.push(AF_INET6 | TRANSPORT_STREAM);
                buf.write_all(&IPV6_ADDR_LEN.to_be_bytes())?;
                buf.write_all(&src.octets())?;
                buf.write_all(&dst.octets())?;
            }
        }

        buf.write_all(&self.src_addr.port().to_be_bytes())?;
        buf.write_all(&self.dst_addr.port().to_be_bytes())?;
        Ok(buf)
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse a v1 header from the start of `data`.
///
/// Returns the header and the number of bytes consumed.
pub fn parse_v1(data: &[u8]) -> Result<(ProxyHeader, usize), ProxyHeaderError> {
    let prefix_len = data.len().min(V1_PREFIX.len());
    if data[..prefix_len] != V1_PREFIX[..prefix_len] {
        return Err(ProxyHeaderError::BadSignature);
    }

    let window = &data[..data.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        return if data.len() >= V1_MAX_LEN {
            Err(ProxyHeaderError::Malformed(format!(
                "no CRLF within {} bytes",
                V1_MAX_LEN
            )))
        } else {
            Err(ProxyHeaderError::Truncated)
        };
    };

    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| ProxyHeaderError::Malformed("header is not ASCII".to_string()))?;
    let parts: Vec<&str> = line.split(' ').collect();

    match parts.get(1).copied() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Err(ProxyHeaderError::Unsupported("UNKNOWN protocol")),
        other => {
            return Err(ProxyHeaderError::Malformed(format!(
                "unknown protocol {:?}",
                other
            )))
        }
    }
    if parts.len() != 6 {
        return Err(ProxyHeaderError::Malformed(format!(
            "expected 6 fields, got {}",
            parts.len()
        )));
    }

    let v6 = parts[1] == "TCP6";
    let src_ip = parse_ip(parts[2], v6)?;
    let dst_ip = parse_ip(parts[3], v6)?;
    let src_port = parse_port(parts[4])?;
    let dst_port = parse_port(parts[5])?;

    Ok((
        ProxyHeader::new(
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        ),
        end + 2,
    ))
}

fn parse_ip(text: &str, v6: bool) -> Result<IpAddr, ProxyHeaderError> {
    let parsed = if v6 {
        text.parse::<Ipv6Addr>().map(IpAddr::V6).ok()
    } else {
        text.parse::<Ipv4Addr>().map(IpAddr::V4).ok()
    };
    parsed.ok_or_else(|| ProxyHeaderError::Malformed(format!("bad address {:?}", text)))
}

fn parse_port(text: &str) -> Result<u16, ProxyHeaderError> {
    text.parse()
        .map_err(|_| ProxyHeaderError::Malformed(format!("bad port {:?}", text)))
}

/// Parse a v2 header from the start of `data`. TLVs are skipped.
///
/// Returns the header and the number of bytes consumed.
pub fn parse_v2(data: &[u8]) -> Result<(ProxyHeader, usize), ProxyHeaderError> {
    let sig_len = data.len().min(V2_SIGNATURE.len());
    if data[..sig_len] != V2_SIGNATURE[..sig_len] {
        return Err(ProxyHeaderError::BadSignature);
    }
    if data.len() < V2_FIXED_LEN {
        return Err(ProxyHeaderError::Truncated);
    }

    let addr_len = v2_block_len(&data[..V2_FIXED_LEN])?;
    let family_protocol = data[13];

    if data.len() < V2_FIXED_LEN + addr_len {
        return Err(ProxyHeaderError::Truncated);
    }
    let block = &data[V2_FIXED_LEN..V2_FIXED_LEN + addr_len];

    let header = match family_protocol {
        x if x == (AF_INET | TRANSPORT_STREAM) => {
            if addr_len < IPV4_ADDR_LEN as usize {
                return Err(ProxyHeaderError::Malformed("short IPv4 block".to_string()));
            }
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            ProxyHeader::new(
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            )
        }
        x if x == (AF_INET6 | TRANSPORT_STREAM) => {
            if addr_len < IPV6_ADDR_LEN as usize {
                return Err(ProxyHeaderError::Malformed("short IPv6 block".to_string()));
            }
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&block[0..16]);
            dst_octets.copy_from_slice(&block[16..32]);
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            ProxyHeader::new(
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            )
        }
        _ => return Err(ProxyHeaderError::Unsupported("non-TCP transport")),
    };

    Ok((header, V2_FIXED_LEN + addr_len))
}

/// Check version, command, family and length in the fixed part of a v2
/// header and return the length of the address block that follows.
fn v2_block_len(fixed: &[u8]) -> Result<usize, ProxyHeaderError> {
    let version_command = fixed[12];
    let family_protocol = fixed[13];
    let addr_len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;

    if version_command >> 4 != 2 {
        return Err(ProxyHeaderError::Malformed(format!(
            "version {}",
            version_command >> 4
        )));
    }
    match version_command & 0x0F {
        COMMAND_PROXY => {}
        COMMAND_LOCAL => return Err(ProxyHeaderError::Unsupported("LOCAL command")),
        other => {
            return Err(ProxyHeaderError::Malformed(format!("command {:#x}", other)));
        }
    }

    match family_protocol {
        x if x == (AF_INET | TRANSPORT_STREAM) || x == (AF_INET6 | TRANSPORT_STREAM) => {}
        x if x >> 4 == AF_UNSPEC >> 4 => {
            return Err(ProxyHeaderError::Unsupported("unspecified address family"))
        }
        _ => return Err(ProxyHeaderError::Unsupported("non-TCP transport")),
    }

    if addr_len > V2_MAX_ADDR_LEN {
        return Err(ProxyHeaderError::Malformed(format!(
            "address block of {} bytes exceeds {}",
            addr_len, V2_MAX_ADDR_LEN
        )));
    }
    Ok(addr_len)
}

// =============================================================================
// Stream Decoding
// =============================================================================

/// Reads a PROXY header off an accepted connection.
///
/// Implementations must consume exactly the header and nothing more.
#[async_trait]
pub trait HeaderDecoder: Send + Sync {
    async fn decode(&self, stream: &mut TcpStream) -> Result<ProxyHeader, ProxyHeaderError>;
}

/// Default decoder for one configured protocol version.
#[derive(Debug, Clone)]
pub struct ProxyProtocolDecoder {
    version: ProxyVersion,
    timeout: Duration,
}

impl ProxyProtocolDecoder {
    pub fn new(version: ProxyVersion, timeout: Duration) -> Self {
        Self { version, timeout }
    }

    pub fn version(&self) -> ProxyVersion {
        self.version
    }

    /// Read one header from any byte source, bounded by the timeout.
    pub async fn read<R>(&self, reader: &mut R) -> Result<ProxyHeader, ProxyHeaderError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let read = async {
            match self.version {
                ProxyVersion::V1 => read_v1(reader).await,
                ProxyVersion::V2 => read_v2(reader).await,
            }
        };
        tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| ProxyHeaderError::Timeout)?
    }
}

#[async_trait]
impl HeaderDecoder for ProxyProtocolDecoder {
    async fn decode(&self, stream: &mut TcpStream) -> Result<ProxyHeader, ProxyHeaderError> {
        self.read(stream).await
    }
}

/// v1 has no length prefix, so read byte by byte up to the CRLF.
async fn read_v1<R>(reader: &mut R) -> Result<ProxyHeader, ProxyHeaderError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut line = Vec::with_capacity(V1_MAX_LEN);
    loop {
        line.push(reader.read_u8().await?);

        if line.len() <= V1_PREFIX.len() && line[..] != V1_PREFIX[..line.len()] {
            return Err(ProxyHeaderError::BadSignature);
        }
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() >= V1_MAX_LEN {
            return Err(ProxyHeaderError::Malformed(format!(
                "no CRLF within {} bytes",
                V1_MAX_LEN
            )));
        }
    }
    parse_v1(&line).map(|(header, _)| header)
}

async fn read_v2<R>(reader: &mut R) -> Result<ProxyHeader, ProxyHeaderError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; V2_FIXED_LEN];
    reader.read_exact(&mut buf).await?;
    if buf[..12] != V2_SIGNATURE {
        return Err(ProxyHeaderError::BadSignature);
    }

    // Validate before sizing the buffer from untrusted input.
    let addr_len = v2_block_len(&buf)?;
    buf.resize(V2_FIXED_LEN + addr_len, 0);
    reader.read_exact(&mut buf[V2_FIXED_LEN..]).await?;

    parse_v2(&buf).map(|(header, _)| header)
}
