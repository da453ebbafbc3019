use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseAddressError;

/// Network address of a tablet server, `host:port`. IPv6 hosts are written in brackets.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for HostAndPort {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseAddressError::MissingPort(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(ParseAddressError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseAddressError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for HostAndPort {
    type Error = ParseAddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostAndPort> for String {
    fn from(value: HostAndPort) -> Self {
        value.to_string()
    }
}

impl Display for HostAndPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One live process lifetime of a tablet server. A restart on the same address
/// acquires a new lock and therefore yields a different instance.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ServerInstance {
    address: HostAndPort,
    session: String,
}

impl ServerInstance {
    pub fn new(address: HostAndPort, session: impl Into<String>) -> Self {
        Self {
            address,
            session: session.into(),
        }
    }

    pub fn address(&self) -> &HostAndPort {
        &self.address
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

impl Display for ServerInstance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.address, self.session)
    }
}

/// Lookup key accepted by `find`: `host:port` or `host:port[session]`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InstanceLookup {
    pub address: HostAndPort,
    pub session: Option<String>,
}

impl InstanceLookup {
    pub fn matches(&self, instance: &ServerInstance) -> bool {
        instance.address == self.address
            && self.session.as_deref().map_or(true, |s| s == instance.session)
    }
}

impl FromStr for InstanceLookup {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let open = s.rfind(':').and_then(|colon| s[colon..].find('[').map(|offset| colon + offset));
        let (address, session) = match open {
            Some(open) => {
                let session = s[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| ParseAddressError::UnterminatedSession(s.to_string()))?;
                (&s[..open], Some(session.to_string()))
            }
            None => (s, None),
        };
        Ok(Self {
            address: address.parse()?,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ParseAddressError;
    use crate::server_instance::{HostAndPort, InstanceLookup, ServerInstance};

    #[test]
    fn parse_host_and_port() {
        let address: HostAndPort = "10.0.0.5:9997".parse().unwrap();
        assert_eq!(address.host(), "10.0.0.5");
        assert_eq!(address.port(), 9997);
        assert_eq!(address.to_string(), "10.0.0.5:9997");
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let address: HostAndPort = "[::1]:9997".parse().unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.to_string(), "[::1]:9997");
    }

    #[test]
    fn reject_bad_addresses() {
        assert_eq!("localhost".parse::<HostAndPort>(), Err(ParseAddressError::MissingPort("localhost".to_string())));
        assert_eq!(":9997".parse::<HostAndPort>(), Err(ParseAddressError::EmptyHost(":9997".to_string())));
        assert_eq!("host:port".parse::<HostAndPort>(), Err(ParseAddressError::InvalidPort("host:port".to_string())));
    }

    #[test]
    fn lookup_without_session() {
        let lookup: InstanceLookup = "10.0.0.5:9997".parse().unwrap();
        assert_eq!(lookup.session, None);
        let instance = ServerInstance::new("10.0.0.5:9997".parse().unwrap(), "123abc");
        assert!(lookup.matches(&instance));
    }

    #[test]
    fn lookup_with_session() {
        let lookup: InstanceLookup = "10.0.0.5:9997[123abc]".parse().unwrap();
        assert_eq!(lookup.session.as_deref(), Some("123abc"));
        let same = ServerInstance::new("10.0.0.5:9997".parse().unwrap(), "123abc");
        let restarted = ServerInstance::new("10.0.0.5:9997".parse().unwrap(), "456def");
        assert!(lookup.matches(&same));
        assert!(!lookup.matches(&restarted));
    }

    #[test]
    fn lookup_ipv6_with_session() {
        let lookup: InstanceLookup = "[::1]:9997[ff]".parse().unwrap();
        assert_eq!(lookup.address, HostAndPort::new("::1", 9997));
        assert_eq!(lookup.session.as_deref(), Some("ff"));
    }

    #[test]
    fn lookup_unterminated_session() {
        let error = "10.0.0.5:9997[abc".parse::<InstanceLookup>().unwrap_err();
        assert_eq!(error, ParseAddressError::UnterminatedSession("10.0.0.5:9997[abc".to_string()));
    }

    #[test]
    fn instance_display_round_trips_through_lookup() {
        let instance = ServerInstance::new(HostAndPort::new("tserver-1", 9997), "1a2b");
        assert_eq!(instance.to_string(), "tserver-1:9997[1a2b]");
        let lookup: InstanceLookup = instance.to_string().parse().unwrap();
        assert!(lookup.matches(&instance));
    }
}
