//! Host configuration.
//!
//! A host is assembled from a list of option constructors applied to a
//! [`Config`]. Several options exist purely so callers written against the
//! wider libp2p option surface keep compiling; the baseline stack is always
//! TCP + noise + yamux.

use crate::error::{NetworkError, NetworkResult};
use quay_core::{Keypair, Multiaddr, PeerId};
use std::time::Duration;

/// Transform applied to the advertised addresses.
pub type AddrsFactory = Box<dyn Fn(Vec<Multiaddr>) -> Vec<Multiaddr> + Send + Sync>;

/// Settings of a host.
///
/// Not a stable surface; build hosts through the option constructors and
/// [`crate::new`].
pub struct Config {
    pub peer_key: Option<Keypair>,
    pub peer_id: Option<PeerId>,
    /// Identifier reported at the identify layer; unused by the core.
    pub user_agent: String,
    pub listen_addrs: Vec<Multiaddr>,
    pub addrs_factory: Option<AddrsFactory>,
    /// Per-address dial deadline.
    pub dial_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("peer_key", &self.peer_key)
            .field("peer_id", &self.peer_id)
            .field("user_agent", &self.user_agent)
            .field("listen_addrs", &self.listen_addrs)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_key: None,
            peer_id: None,
            user_agent: String::new(),
            listen_addrs: Vec::new(),
            addrs_factory: None,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// A single configuration step.
pub type HostOption = Box<dyn FnOnce(&mut Config) -> NetworkResult<()> + Send>;

/// Apply the given options to a fresh config, returning the first error
/// encountered (if any).
pub fn apply(options: Vec<HostOption>) -> NetworkResult<Config> {
    let mut config = Config::default();
    for option in options {
        option(&mut config)?;
    }
    Ok(config)
}

/// Use the given private key as the host identity. Setting a second
/// identity is an error.
pub fn identity(keypair: Keypair) -> HostOption {
    Box::new(move |config| {
        if config.peer_key.is_some() {
            return Err(NetworkError::Config(
                "cannot specify multiple identities".into(),
            ));
        }
        config.peer_id = Some(PeerId::from_public_key(keypair.public()));
        config.peer_key = Some(keypair);
        Ok(())
    })
}

/// Listen on the given addresses, in addition to any configured earlier.
pub fn listen_addrs(addrs: Vec<Multiaddr>) -> HostOption {
    Box::new(move |config| {
        config.listen_addrs.extend(addrs);
        Ok(())
    })
}

/// Set the user agent sent along with the identify protocol.
pub fn user_agent(agent: impl Into<String> + Send + 'static) -> HostOption {
    Box::new(move |config| {
        config.user_agent = agent.into();
        Ok(())
    })
}

/// Transform the advertised addresses. Setting a second factory is an
/// error.
pub fn addrs_factory<F>(factory: F) -> HostOption
where
    F: Fn(Vec<Multiaddr>) -> Vec<Multiaddr> + Send + Sync + 'static,
{
    Box::new(move |config| {
        if config.addrs_factory.is_some() {
            return Err(NetworkError::Config(
                "cannot specify multiple address factories".into(),
            ));
        }
        config.addrs_factory = Some(Box::new(factory));
        Ok(())
    })
}

/// Set the per-address dial deadline.
pub fn dial_timeout(timeout: Duration) -> HostOption {
    Box::new(move |config| {
        config.dial_timeout = timeout;
        Ok(())
    })
}

fn does_nothing() -> HostOption {
    Box::new(|_| Ok(()))
}

/// Accepted for compatibility; TCP is always used.
pub fn transport<T>(_constructor: T) -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; yamux is always used.
pub fn muxer<T>(_name: &str, _muxer: T) -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; noise security is always used.
pub fn security<T>(_name: &str, _constructor: T) -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; no core effect.
pub fn ping<T>(_enabled: T) -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; no core effect.
pub fn nat_port_map() -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; no core effect.
pub fn disable_relay() -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; no core effect.
pub fn resource_manager<T>(_manager: T) -> HostOption {
    does_nothing()
}

/// Accepted for compatibility; no core effect.
pub fn connection_gater<T>(_gater: T) -> HostOption {
    does_nothing()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.peer_key.is_none());
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert!(config.listen_addrs.is_empty());
    }

    #[test]
    fn test_identity_sets_peer_id() {
        let keypair = Keypair::generate();
        let expected = PeerId::from_public_key(keypair.public());

        let config = apply(vec![identity(keypair)]).unwrap();
        assert_eq!(config.peer_id.unwrap(), expected);
        assert!(config.peer_key.is_some());
    }

    #[test]
    fn test_double_identity_is_an_error() {
        let result = apply(vec![
            identity(Keypair::generate()),
            identity(Keypair::generate()),
        ]);
        assert!(matches!(result.unwrap_err(), NetworkError::Config(_)));
    }

    #[test]
    fn test_listen_addrs_appends() {
        let config = apply(vec![
            listen_addrs(vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]),
            listen_addrs(vec!["/ip4/127.0.0.1/tcp/2".parse().unwrap()]),
        ])
        .unwrap();
        assert_eq!(config.listen_addrs.len(), 2);
    }

    #[test]
    fn test_double_addrs_factory_is_an_error() {
        let result = apply(vec![
            addrs_factory(|addrs| addrs),
            addrs_factory(|addrs| addrs),
        ]);
        assert!(matches!(result.unwrap_err(), NetworkError::Config(_)));
    }

    #[test]
    fn test_compatibility_options_do_nothing() {
        let config = apply(vec![
            transport("quic"),
            muxer("/mplex/6.7.0", ()),
            security("/tls", ()),
            ping(true),
            nat_port_map(),
            disable_relay(),
            resource_manager(()),
            connection_gater(()),
            dial_timeout(Duration::from_secs(3)),
        ])
        .unwrap();
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert!(config.peer_key.is_none());
        assert!(config.listen_addrs.is_empty());
    }
}
