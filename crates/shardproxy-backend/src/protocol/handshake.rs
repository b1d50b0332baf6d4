//! Connection phase: server greeting, handshake response and authentication

use super::message::ErrPacket;
use super::packet::PacketStream;
use super::{
    put_lenenc_bytes, put_null_terminated, CapabilityFlags, PacketReader, MAX_PACKET_SIZE,
    UTF8MB4_CHARSET,
};
use crate::datasource::DataSourceConfig;
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, warn};

/// Authentication plugins this client can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    /// mysql_native_password
    NativePassword,
    /// caching_sha2_password
    CachingSha2Password,
}

impl AuthPlugin {
    /// Look up a plugin by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mysql_native_password" => Some(Self::NativePassword),
            "caching_sha2_password" => Some(Self::CachingSha2Password),
            _ => None,
        }
    }

    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::NativePassword => "mysql_native_password",
            Self::CachingSha2Password => "caching_sha2_password",
        }
    }

    /// Scramble `password` with the server nonce
    pub fn scramble(self, password: &str, nonce: &[u8]) -> Vec<u8> {
        if password.is_empty() {
            return Vec::new();
        }
        match self {
            Self::NativePassword => native_password(password, nonce),
            Self::CachingSha2Password => caching_sha2_password(password, nonce),
        }
    }
}

/// SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))
fn native_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)
fn caching_sha2_password(password: &str, nonce: &[u8]) -> Vec<u8> {
    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(nonce);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Initial greeting (HandshakeV10)
#[derive(Debug, Clone)]
pub struct HandshakePacket {
    /// Always 10 for supported servers
    pub protocol_version: u8,
    /// Server version string
    pub server_version: String,
    /// Server-side thread id
    pub connection_id: u32,
    /// Capabilities the server offers
    pub capability_flags: CapabilityFlags,
    /// Server default charset
    pub character_set: u8,
    /// Status flags
    pub status_flags: u16,
    /// Scramble nonce (both parts joined, trailing NUL removed)
    pub nonce: Vec<u8>,
    /// Default auth plugin name
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    /// Parse a greeting payload. A server refusing the connection
    /// (too many connections, host blocked) sends an ERR instead.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() == Some(&0xFF) {
            let err = ErrPacket::parse(data, CapabilityFlags::new(0))?;
            return Err(err.into_error());
        }

        let mut r = PacketReader::new(data);
        let protocol_version = r.u8()?;
        if protocol_version != 10 {
            return Err(Error::protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }
        let server_version = String::from_utf8_lossy(r.null_terminated()).into_owned();
        let connection_id = r.u32()?;
        let mut nonce = r.take(8)?.to_vec();
        r.skip(1)?;

        let cap_lower = u32::from(r.u16()?);
        if r.is_empty() {
            return Ok(Self {
                protocol_version,
                server_version,
                connection_id,
                capability_flags: CapabilityFlags::new(cap_lower),
                character_set: 0,
                status_flags: 0,
                nonce,
                auth_plugin_name: String::new(),
            });
        }

        let character_set = r.u8()?;
        let status_flags = r.u16()?;
        let cap_upper = u32::from(r.u16()?);
        let capability_flags = CapabilityFlags::new((cap_upper << 16) | cap_lower);
        let auth_data_len = usize::from(r.u8()?);
        r.skip(10)?;

        if capability_flags.has(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let part2_len = auth_data_len.saturating_sub(8).max(13).min(r.remaining());
            let part2 = r.take(part2_len)?;
            let end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
            nonce.extend_from_slice(&part2[..end]);
        }

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            String::from_utf8_lossy(r.null_terminated()).into_owned()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            nonce,
            auth_plugin_name,
        })
    }
}

/// Capabilities this client asks for; the server's offer is intersected in
pub fn client_capabilities(server: CapabilityFlags, with_db: bool) -> CapabilityFlags {
    let mut wanted = CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_LONG_PASSWORD
        | CapabilityFlags::CLIENT_LONG_FLAG
        | CapabilityFlags::CLIENT_TRANSACTIONS
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CapabilityFlags::CLIENT_DEPRECATE_EOF;
    if with_db {
        wanted |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
    }
    CapabilityFlags::new(wanted & server.value())
}

/// Encode HandshakeResponse41
pub fn encode_handshake_response(
    caps: CapabilityFlags,
    username: &str,
    auth_response: &[u8],
    database: Option<&str>,
    plugin: AuthPlugin,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + username.len() + auth_response.len());
    buf.put_u32_le(caps.value());
    buf.put_u32_le(MAX_PACKET_SIZE);
    buf.put_u8(UTF8MB4_CHARSET);
    buf.put_slice(&[0u8; 23]);
    put_null_terminated(&mut buf, username.as_bytes());

    if caps.has(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        put_lenenc_bytes(&mut buf, auth_response);
    } else {
        buf.put_u8(auth_response.len() as u8);
        buf.put_slice(auth_response);
    }

    if let Some(db) = database.filter(|_| caps.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB)) {
        put_null_terminated(&mut buf, db.as_bytes());
    }
    if caps.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        put_null_terminated(&mut buf, plugin.name().as_bytes());
    }
    buf
}

/// Outcome of a completed login
#[derive(Debug, Clone)]
pub struct Session {
    /// Negotiated capabilities
    pub capabilities: CapabilityFlags,
    /// Server version string
    pub server_version: String,
    /// Server-side connection id
    pub connection_id: u32,
}

/// Run the connection phase for `datasource` on a freshly connected stream
pub async fn login(stream: &mut PacketStream, datasource: &DataSourceConfig) -> Result<Session> {
    let unreachable = |message: String| Error::unreachable(datasource.name.as_str(), message);
    let rejected = |err: Error| match err {
        Error::Server { code, message, .. } => {
            unreachable(format!("authentication rejected ({code}): {message}"))
        }
        other => other,
    };

    stream.reset_sequence();
    let greeting = stream.read_packet().await?;
    let handshake = HandshakePacket::parse(&greeting).map_err(rejected)?;
    if !handshake
        .capability_flags
        .has(CapabilityFlags::CLIENT_PROTOCOL_41)
    {
        return Err(unreachable(format!(
            "server {} does not speak protocol 4.1",
            handshake.server_version
        )));
    }

    let caps = client_capabilities(handshake.capability_flags, datasource.database.is_some());
    let mut plugin = AuthPlugin::from_name(&handshake.auth_plugin_name).unwrap_or_else(|| {
        warn!(
            datasource = %datasource.name,
            plugin = %handshake.auth_plugin_name,
            "unknown default auth plugin, answering with mysql_native_password"
        );
        AuthPlugin::NativePassword
    });
    let password = datasource.password.expose_secret();

    let response = encode_handshake_response(
        caps,
        &datasource.username,
        &plugin.scramble(password, &handshake.nonce),
        datasource.database.as_deref(),
        plugin,
    );
    stream.write_packet(&response).await?;

    let mut switched = false;
    loop {
        let packet = stream.read_packet().await?;
        match packet.first() {
            Some(0x00) => break,
            Some(0xFF) => {
                let err = ErrPacket::parse(&packet, caps)?;
                return Err(rejected(err.into_error()));
            }
            Some(0xFE) if !switched => {
                let mut r = PacketReader::new(&packet[1..]);
                let name = String::from_utf8_lossy(r.null_terminated()).into_owned();
                let nonce = r.rest();
                let nonce = nonce.strip_suffix(&[0]).unwrap_or(nonce);
                plugin = AuthPlugin::from_name(&name).ok_or_else(|| {
                    unreachable(format!("unsupported auth plugin switch to '{name}'"))
                })?;
                debug!(datasource = %datasource.name, plugin = %name, "auth switch");
                switched = true;
                stream.write_packet(&plugin.scramble(password, nonce)).await?;
            }
            Some(0x01) if plugin == AuthPlugin::CachingSha2Password => match packet.get(1) {
                Some(0x03) => debug!(datasource = %datasource.name, "caching_sha2 fast auth"),
                Some(0x04) => {
                    return Err(unreachable(
                        "caching_sha2_password full authentication requires a secure channel"
                            .to_string(),
                    ))
                }
                _ => return Err(Error::protocol("malformed caching_sha2 auth data")),
            },
            Some(other) => {
                return Err(Error::protocol(format!(
                    "unexpected authentication response 0x{other:02X}"
                )))
            }
            None => return Err(Error::protocol("empty authentication response")),
        }
    }

    Ok(Session {
        capabilities: caps,
        server_version: handshake.server_version,
        connection_id: handshake.connection_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting(caps: u32, plugin: &str) -> Vec<u8> {
        let mut buf = vec![10];
        buf.extend_from_slice(b"8.0.36\0");
        buf.extend_from_slice(&42u32.to_le_bytes());
        buf.extend_from_slice(b"abcdefgh");
        buf.push(0);
        buf.extend_from_slice(&(caps as u16).to_le_bytes());
        buf.push(45);
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        buf.push(21);
        buf.extend_from_slice(&[0u8; 10]);
        buf.extend_from_slice(b"ijklmnopqrst\0");
        buf.extend_from_slice(plugin.as_bytes());
        buf.push(0);
        buf
    }

    const SERVER_CAPS: u32 = CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_CONNECT_WITH_DB
        | CapabilityFlags::CLIENT_LONG_PASSWORD;

    #[test]
    fn test_parse_greeting() {
        let hs = HandshakePacket::parse(&greeting(SERVER_CAPS, "mysql_native_password")).unwrap();
        assert_eq!(hs.server_version, "8.0.36");
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.nonce, b"abcdefghijklmnopqrst");
        assert_eq!(hs.auth_plugin_name, "mysql_native_password");
        assert_eq!(hs.character_set, 45);
    }

    #[test]
    fn test_err_greeting_surfaces_server_error() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1040u16.to_le_bytes());
        data.extend_from_slice(b"Too many connections");
        let err = HandshakePacket::parse(&data).unwrap_err();
        assert!(matches!(err, Error::Server { code: 1040, .. }));
    }

    #[test]
    fn test_capabilities_intersect_with_server() {
        let caps = client_capabilities(CapabilityFlags::new(SERVER_CAPS), true);
        assert!(caps.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(!caps.has(CapabilityFlags::CLIENT_DEPRECATE_EOF));

        let caps = client_capabilities(CapabilityFlags::new(SERVER_CAPS), false);
        assert!(!caps.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
    }

    #[test]
    fn test_native_scramble_known_vector() {
        // SHA1("password") = 5baa61e4c9b93f3f0682250b6cf8331b7ee68fd8
        let nonce = [0u8; 20];
        let scramble = AuthPlugin::NativePassword.scramble("password", &nonce);
        assert_eq!(scramble.len(), 20);
        assert_ne!(&scramble[..], &Sha1::digest(b"password")[..]);
        assert!(AuthPlugin::NativePassword.scramble("", &nonce).is_empty());
    }

    #[test]
    fn test_handshake_response_layout() {
        let caps = CapabilityFlags::new(
            CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_CONNECT_WITH_DB,
        );
        let buf = encode_handshake_response(
            caps,
            "root",
            &[1, 2, 3],
            Some("orders_0"),
            AuthPlugin::NativePassword,
        );
        let mut r = PacketReader::new(&buf);
        assert_eq!(r.u32().unwrap(), caps.value());
        assert_eq!(r.u32().unwrap(), MAX_PACKET_SIZE);
        assert_eq!(r.u8().unwrap(), UTF8MB4_CHARSET);
        r.skip(23).unwrap();
        assert_eq!(r.null_terminated(), b"root");
        assert_eq!(r.u8().unwrap(), 3);
        assert_eq!(r.take(3).unwrap(), &[1, 2, 3]);
        assert_eq!(r.null_terminated(), b"orders_0");
        assert_eq!(r.null_terminated(), b"mysql_native_password");
    }
}
