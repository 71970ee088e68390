//! Self-describing network addresses.
//!
//! A multiaddress is an ordered sequence of `(protocol, value)` components,
//! e.g. `/ip4/127.0.0.1/tcp/9000` or
//! `/ip4/1.2.3.4/tcp/9000/p2p/16Uiu2HA...`. Every component carries its own
//! protocol code, so no ambient context is needed to parse one.
//!
//! Text form is `/<name>/<value>/...`; binary form is a concatenation of
//! `varint(code) | value` with code-specific value encodings.

use crate::peer::PeerId;
use crate::{varint, CoreError, CoreResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Registered multiaddr protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4,
    Tcp,
    Dns,
    Dns4,
    Dns6,
    Ip6,
    Udp,
    P2p,
    Tls,
    Sni,
    QuicV1,
    Ws,
}

impl Protocol {
    /// Multicodec code of this protocol.
    pub const fn code(self) -> u64 {
        match self {
            Protocol::Ip4 => 4,
            Protocol::Tcp => 6,
            Protocol::Dns => 53,
            Protocol::Dns4 => 54,
            Protocol::Dns6 => 55,
            Protocol::Ip6 => 41,
            Protocol::Udp => 273,
            Protocol::P2p => 421,
            Protocol::Tls => 448,
            Protocol::Sni => 449,
            Protocol::QuicV1 => 461,
            Protocol::Ws => 477,
        }
    }

    /// Text name of this protocol.
    pub const fn name(self) -> &'static str {
        match self {
            Protocol::Ip4 => "ip4",
            Protocol::Tcp => "tcp",
            Protocol::Dns => "dns",
            Protocol::Dns4 => "dns4",
            Protocol::Dns6 => "dns6",
            Protocol::Ip6 => "ip6",
            Protocol::Udp => "udp",
            Protocol::P2p => "p2p",
            Protocol::Tls => "tls",
            Protocol::Sni => "sni",
            Protocol::QuicV1 => "quic-v1",
            Protocol::Ws => "ws",
        }
    }

    fn from_name(name: &str) -> Option<Protocol> {
        Some(match name {
            "ip4" => Protocol::Ip4,
            "tcp" => Protocol::Tcp,
            "dns" => Protocol::Dns,
            "dns4" => Protocol::Dns4,
            "dns6" => Protocol::Dns6,
            "ip6" => Protocol::Ip6,
            "udp" => Protocol::Udp,
            "p2p" => Protocol::P2p,
            "tls" => Protocol::Tls,
            "sni" => Protocol::Sni,
            "quic-v1" => Protocol::QuicV1,
            "ws" => Protocol::Ws,
            _ => return None,
        })
    }

    fn from_code(code: u64) -> Option<Protocol> {
        Some(match code {
            4 => Protocol::Ip4,
            6 => Protocol::Tcp,
            53 => Protocol::Dns,
            54 => Protocol::Dns4,
            55 => Protocol::Dns6,
            41 => Protocol::Ip6,
            273 => Protocol::Udp,
            421 => Protocol::P2p,
            448 => Protocol::Tls,
            449 => Protocol::Sni,
            461 => Protocol::QuicV1,
            477 => Protocol::Ws,
            _ => return None,
        })
    }
}

/// One `(protocol, value)` element of a multiaddress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    Ip4(Ipv4Addr),
    Tcp(u16),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Ip6(Ipv6Addr),
    Udp(u16),
    P2p(PeerId),
    Tls,
    Sni(String),
    QuicV1,
    Ws,
}

impl Component {
    /// The protocol this component belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            Component::Ip4(_) => Protocol::Ip4,
            Component::Tcp(_) => Protocol::Tcp,
            Component::Dns(_) => Protocol::Dns,
            Component::Dns4(_) => Protocol::Dns4,
            Component::Dns6(_) => Protocol::Dns6,
            Component::Ip6(_) => Protocol::Ip6,
            Component::Udp(_) => Protocol::Udp,
            Component::P2p(_) => Protocol::P2p,
            Component::Tls => Protocol::Tls,
            Component::Sni(_) => Protocol::Sni,
            Component::QuicV1 => Protocol::QuicV1,
            Component::Ws => Protocol::Ws,
        }
    }

    /// The value in its text form, if the protocol carries one.
    pub fn value(&self) -> Option<String> {
        match self {
            Component::Ip4(ip) => Some(ip.to_string()),
            Component::Tcp(port) | Component::Udp(port) => Some(port.to_string()),
            Component::Dns(host) | Component::Dns4(host) | Component::Dns6(host) => {
                Some(host.clone())
            }
            Component::Ip6(ip) => Some(ip.to_string()),
            Component::P2p(id) => Some(id.to_base58()),
            Component::Sni(host) => Some(host.clone()),
            Component::Tls | Component::QuicV1 | Component::Ws => None,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => write!(f, "/{}/{}", self.protocol().name(), value),
            None => write!(f, "/{}", self.protocol().name()),
        }
    }
}

/// An ordered, immutable sequence of address components.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiaddr {
    components: Vec<Component>,
}

impl Multiaddr {
    /// An empty multiaddress.
    pub fn empty() -> Self {
        Multiaddr::default()
    }

    /// Build from a component sequence.
    pub fn from_components(components: Vec<Component>) -> Self {
        Multiaddr { components }
    }

    /// Iterate over the components.
    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Returns a new multiaddress with `component` appended.
    pub fn with(&self, component: Component) -> Multiaddr {
        let mut components = self.components.clone();
        components.push(component);
        Multiaddr { components }
    }

    /// Returns a new multiaddress with a trailing `/p2p/<id>` component.
    pub fn with_p2p(&self, id: PeerId) -> Multiaddr {
        self.with(Component::P2p(id))
    }

    /// Whether any component belongs to the given protocol.
    pub fn has(&self, protocol: Protocol) -> bool {
        self.components.iter().any(|c| c.protocol() == protocol)
    }

    /// The text value of the first component of the given protocol.
    ///
    /// Value-less protocols yield an empty string when present.
    pub fn value_for_protocol(&self, protocol: Protocol) -> Option<String> {
        self.components
            .iter()
            .find(|c| c.protocol() == protocol)
            .map(|c| c.value().unwrap_or_default())
    }

    /// Split a trailing `/p2p/<id>` suffix off the transport prefix.
    ///
    /// Returns `(None, Some(id))` for a bare `/p2p/<id>` address and
    /// `(Some(self), None)` when there is no suffix.
    pub fn split_p2p(&self) -> (Option<Multiaddr>, Option<PeerId>) {
        match self.components.split_last() {
            Some((Component::P2p(id), prefix)) => {
                let transport = if prefix.is_empty() {
                    None
                } else {
                    Some(Multiaddr::from_components(prefix.to_vec()))
                };
                (transport, Some(id.clone()))
            }
            Some(_) => (Some(self.clone()), None),
            None => (None, None),
        }
    }

    /// Resolve to a socket address.
    ///
    /// Requires one ip4/ip6 component and one tcp/udp component.
    pub fn to_socket_addr(&self) -> CoreResult<SocketAddr> {
        let ip: IpAddr = self
            .components
            .iter()
            .find_map(|c| match c {
                Component::Ip4(ip) => Some(IpAddr::V4(*ip)),
                Component::Ip6(ip) => Some(IpAddr::V6(*ip)),
                _ => None,
            })
            .ok_or_else(|| CoreError::bad_addr(self.to_string(), "no ip"))?;
        let port = self
            .components
            .iter()
            .find_map(|c| match c {
                Component::Tcp(port) | Component::Udp(port) => Some(*port),
                _ => None,
            })
            .ok_or_else(|| CoreError::bad_addr(self.to_string(), "no transport"))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Binary encoding: `varint(code) | value` per component.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.components.len() * 8);
        for component in &self.components {
            varint::encode(component.protocol().code(), &mut out);
            match component {
                Component::Ip4(ip) => out.extend_from_slice(&ip.octets()),
                Component::Ip6(ip) => out.extend_from_slice(&ip.octets()),
                Component::Tcp(port) | Component::Udp(port) => {
                    out.extend_from_slice(&port.to_be_bytes())
                }
                Component::Dns(host)
                | Component::Dns4(host)
                | Component::Dns6(host)
                | Component::Sni(host) => {
                    varint::encode(host.len() as u64, &mut out);
                    out.extend_from_slice(host.as_bytes());
                }
                Component::P2p(id) => {
                    varint::encode(id.as_bytes().len() as u64, &mut out);
                    out.extend_from_slice(id.as_bytes());
                }
                Component::Tls | Component::QuicV1 | Component::Ws => {}
            }
        }
        out
    }

    /// Decode the binary encoding.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Multiaddr> {
        fn take<'a>(rest: &mut &'a [u8], n: usize, all: &[u8]) -> CoreResult<&'a [u8]> {
            if rest.len() < n {
                return Err(CoreError::bad_addr(hex::encode(all), "truncated value"));
            }
            let (value, tail) = rest.split_at(n);
            *rest = tail;
            Ok(value)
        }
        fn take_prefixed<'a>(rest: &mut &'a [u8], all: &[u8]) -> CoreResult<&'a [u8]> {
            let (len, used) = varint::decode(rest)
                .map_err(|_| CoreError::bad_addr(hex::encode(all), "truncated length"))?;
            *rest = &rest[used..];
            take(rest, len as usize, all)
        }

        let mut rest = bytes;
        let mut components = Vec::new();
        while !rest.is_empty() {
            let (code, used) = varint::decode(rest)
                .map_err(|_| CoreError::bad_addr(hex::encode(bytes), "truncated protocol code"))?;
            rest = &rest[used..];
            let protocol = Protocol::from_code(code).ok_or_else(|| {
                CoreError::bad_addr(hex::encode(bytes), format!("unknown code {code}"))
            })?;

            let component = match protocol {
                Protocol::Ip4 => {
                    let octets: [u8; 4] = take(&mut rest, 4, bytes)?.try_into().expect("4 bytes");
                    Component::Ip4(Ipv4Addr::from(octets))
                }
                Protocol::Ip6 => {
                    let octets: [u8; 16] =
                        take(&mut rest, 16, bytes)?.try_into().expect("16 bytes");
                    Component::Ip6(Ipv6Addr::from(octets))
                }
                Protocol::Tcp | Protocol::Udp => {
                    let be: [u8; 2] = take(&mut rest, 2, bytes)?.try_into().expect("2 bytes");
                    let port = u16::from_be_bytes(be);
                    if protocol == Protocol::Tcp {
                        Component::Tcp(port)
                    } else {
                        Component::Udp(port)
                    }
                }
                Protocol::Dns | Protocol::Dns4 | Protocol::Dns6 | Protocol::Sni => {
                    let host = std::str::from_utf8(take_prefixed(&mut rest, bytes)?)
                        .map_err(|_| CoreError::bad_addr(hex::encode(bytes), "host is not utf-8"))?
                        .to_owned();
                    match protocol {
                        Protocol::Dns => Component::Dns(host),
                        Protocol::Dns4 => Component::Dns4(host),
                        Protocol::Dns6 => Component::Dns6(host),
                        _ => Component::Sni(host),
                    }
                }
                Protocol::P2p => {
                    let id = PeerId::from_bytes(take_prefixed(&mut rest, bytes)?.to_vec())
                        .map_err(|e| CoreError::bad_addr(hex::encode(bytes), e.to_string()))?;
                    Component::P2p(id)
                }
                Protocol::Tls => Component::Tls,
                Protocol::QuicV1 => Component::QuicV1,
                Protocol::Ws => Component::Ws,
            };
            components.push(component);
        }
        Ok(Multiaddr { components })
    }
}

impl FromStr for Multiaddr {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Multiaddr> {
        // A single trailing slash is tolerated and canonicalized away.
        let trimmed = s.strip_suffix('/').filter(|t| !t.is_empty()).unwrap_or(s);
        let Some(body) = trimmed.strip_prefix('/') else {
            return Err(CoreError::bad_addr(s, "must begin with /"));
        };
        if body.is_empty() {
            return Err(CoreError::bad_addr(s, "empty"));
        }

        let mut parts = body.split('/');
        let mut components = Vec::new();
        while let Some(name) = parts.next() {
            let protocol = Protocol::from_name(name)
                .ok_or_else(|| CoreError::bad_addr(s, format!("unknown protocol {name:?}")))?;
            let mut value = || {
                parts
                    .next()
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| CoreError::bad_addr(s, format!("{name} requires a value")))
            };
            let component = match protocol {
                Protocol::Ip4 => Component::Ip4(
                    value()?
                        .parse()
                        .map_err(|_| CoreError::bad_addr(s, "invalid ip4 address"))?,
                ),
                Protocol::Ip6 => Component::Ip6(
                    value()?
                        .parse()
                        .map_err(|_| CoreError::bad_addr(s, "invalid ip6 address"))?,
                ),
                Protocol::Tcp => Component::Tcp(
                    value()?
                        .parse()
                        .map_err(|_| CoreError::bad_addr(s, "invalid tcp port"))?,
                ),
                Protocol::Udp => Component::Udp(
                    value()?
                        .parse()
                        .map_err(|_| CoreError::bad_addr(s, "invalid udp port"))?,
                ),
                Protocol::Dns => Component::Dns(value()?.to_owned()),
                Protocol::Dns4 => Component::Dns4(value()?.to_owned()),
                Protocol::Dns6 => Component::Dns6(value()?.to_owned()),
                Protocol::Sni => Component::Sni(value()?.to_owned()),
                Protocol::P2p => Component::P2p(
                    value()?
                        .parse()
                        .map_err(|e: CoreError| CoreError::bad_addr(s, e.to_string()))?,
                ),
                Protocol::Tls => Component::Tls,
                Protocol::QuicV1 => Component::QuicV1,
                Protocol::Ws => Component::Ws,
            };
            components.push(component);
        }
        Ok(Multiaddr { components })
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            component.fmt(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ID: &str = "16Uiu2HAkum7hhuMpWqFj3yNLcmQBGmThmqw2ohaCRThXQuKU9ohs";

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_roundtrip() {
        for text in [
            "/ip4/127.0.0.1/tcp/9000",
            "/ip6/::1/tcp/1",
            "/ip4/1.2.3.4/udp/5678/quic-v1",
            "/dns4/example.com/tcp/443/tls/sni/example.com",
            "/ip4/192.168.0.1/tcp/5678/ws",
            &format!("/ip4/192.168.0.1/tcp/5678/p2p/{TEST_ID}"),
            &format!("/p2p/{TEST_ID}"),
        ] {
            let addr = ma(text);
            assert_eq!(addr.to_string(), text);
            assert_eq!(ma(&addr.to_string()), addr);
        }
    }

    #[test]
    fn test_canonicalization() {
        assert_eq!(ma("/ip6/0:0:0:0:0:0:0:1/tcp/1").to_string(), "/ip6/::1/tcp/1");
        assert_eq!(ma("/ip4/127.0.0.1/tcp/9000/").to_string(), "/ip4/127.0.0.1/tcp/9000");
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "invalid/maddr",
            "/ip4",
            "/ip4/not-an-ip/tcp/1",
            "/ip4/127.0.0.1/tcp/99999",
            "/ip4/127.0.0.1/bogus/1",
            "/p2p/not-base58-!!",
        ] {
            assert!(bad.parse::<Multiaddr>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        for text in [
            "/ip4/127.0.0.1/tcp/9000",
            "/ip6/::1/udp/53/quic-v1",
            "/dns/example.com/tcp/443/tls",
            &format!("/ip4/10.0.0.1/tcp/1/p2p/{TEST_ID}"),
        ] {
            let addr = ma(text);
            let decoded = Multiaddr::from_bytes(&addr.to_bytes()).unwrap();
            assert_eq!(decoded, addr);
        }
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Multiaddr::from_bytes(&[0xff, 0xff, 0xff]).is_err());
        // ip4 code with a truncated value
        assert!(Multiaddr::from_bytes(&[4, 127, 0]).is_err());
    }

    #[test]
    fn test_value_for_protocol() {
        let addr = ma("/ip4/127.0.0.1/tcp/9000/tls");
        assert_eq!(addr.value_for_protocol(Protocol::Ip4).unwrap(), "127.0.0.1");
        assert_eq!(addr.value_for_protocol(Protocol::Tcp).unwrap(), "9000");
        assert_eq!(addr.value_for_protocol(Protocol::Tls).unwrap(), "");
        assert!(addr.value_for_protocol(Protocol::Udp).is_none());
    }

    #[test]
    fn test_split_p2p() {
        let (transport, id) = ma(&format!("/ip4/1.2.3.4/tcp/1/p2p/{TEST_ID}")).split_p2p();
        assert_eq!(transport.unwrap(), ma("/ip4/1.2.3.4/tcp/1"));
        assert_eq!(id.unwrap().to_base58(), TEST_ID);

        let (transport, id) = ma(&format!("/p2p/{TEST_ID}")).split_p2p();
        assert!(transport.is_none());
        assert_eq!(id.unwrap().to_base58(), TEST_ID);

        let (transport, id) = ma("/ip4/1.2.3.4/tcp/1").split_p2p();
        assert_eq!(transport.unwrap(), ma("/ip4/1.2.3.4/tcp/1"));
        assert!(id.is_none());
    }

    #[test]
    fn test_to_socket_addr() {
        assert_eq!(
            ma("/ip4/127.0.0.1/tcp/9000").to_socket_addr().unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            ma("/ip6/::1/udp/53").to_socket_addr().unwrap(),
            "[::1]:53".parse::<SocketAddr>().unwrap()
        );
        assert!(ma("/dns4/example.com/tcp/443").to_socket_addr().is_err());
    }

    #[test]
    fn test_with_p2p() {
        let id: PeerId = TEST_ID.parse().unwrap();
        let addr = ma("/ip4/127.0.0.1/tcp/9000").with_p2p(id.clone());
        assert_eq!(addr.to_string(), format!("/ip4/127.0.0.1/tcp/9000/p2p/{TEST_ID}"));
        let (_, split_id) = addr.split_p2p();
        assert_eq!(split_id.unwrap(), id);
    }
}
