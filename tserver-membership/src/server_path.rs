use std::fmt::{Display, Formatter};

use crate::server_instance::HostAndPort;

/// Segment under a server node that holds the lock entries.
pub const LOCK_SEGMENT: &str = "lock";

/// Location of one server in the coordination namespace: `<root>/<group>/<host:port>`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerPath {
    group: String,
    address: HostAndPort,
}

impl ServerPath {
    pub fn new(group: impl Into<String>, address: HostAndPort) -> Self {
        Self {
            group: group.into(),
            address,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn address(&self) -> &HostAndPort {
        &self.address
    }
}

impl Display for ServerPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.address)
    }
}

/// What a coordination path refers to, relative to the server namespace root.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WatchedPath {
    Root,
    Group(String),
    /// A server node, or any descendant of one (lock entries), reduced to the server itself.
    Server(ServerPath),
    Unrelated,
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ServerPathParser {
    root: String,
}

impl ServerPathParser {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn server_key(&self, path: &ServerPath) -> String {
        format!("{}/{}/{}", self.root, path.group, path.address)
    }

    /// Prefix shared by every lock entry of `path`.
    pub fn lock_prefix(&self, path: &ServerPath) -> String {
        format!("{}/{}/", self.server_key(path), LOCK_SEGMENT)
    }

    pub fn lock_key(&self, path: &ServerPath, session: &str) -> String {
        format!("{}{}", self.lock_prefix(path), session)
    }

    pub fn classify(&self, path: &str) -> WatchedPath {
        if path == self.root {
            return WatchedPath::Root;
        }
        let rest = match path.strip_prefix(self.root.as_str()).and_then(|r| r.strip_prefix('/')) {
            Some(rest) => rest,
            None => return WatchedPath::Unrelated,
        };
        let mut segments = rest.split('/');
        let group = match segments.next() {
            Some(group) if !group.is_empty() => group,
            _ => return WatchedPath::Malformed(format!("{} has an empty resource group", path)),
        };
        match segments.next() {
            None => WatchedPath::Group(group.to_string()),
            Some(address) => match address.parse::<HostAndPort>() {
                Ok(address) => WatchedPath::Server(ServerPath::new(group, address)),
                Err(error) => WatchedPath::Malformed(format!("{} {}", path, error)),
            },
        }
    }
}
