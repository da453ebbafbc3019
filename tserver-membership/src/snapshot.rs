use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};

use crate::connection::TServerConnection;
use crate::server_instance::ServerInstance;

/// What the live server set knows about one member.
#[derive(Debug, Clone)]
pub(crate) struct MemberInfo {
    pub(crate) instance: ServerInstance,
    pub(crate) connection: TServerConnection,
    pub(crate) group: String,
}

#[derive(Debug, Clone)]
struct MemberEntry {
    connection: TServerConnection,
    group: String,
}

/// Immutable point-in-time view of the membership. Once handed out it never
/// changes; later mutations produce a new snapshot.
#[derive(Debug, Default)]
pub struct MembershipSnapshot {
    servers: HashSet<ServerInstance>,
    groups: HashMap<String, HashSet<ServerInstance>>,
    members: HashMap<ServerInstance, MemberEntry>,
}

impl MembershipSnapshot {
    pub(crate) fn build<'a>(infos: impl IntoIterator<Item=&'a MemberInfo>) -> Self {
        let mut servers = HashSet::new();
        let mut groups: HashMap<String, HashSet<ServerInstance>> = HashMap::new();
        let mut members = HashMap::new();
        for info in infos {
            servers.insert(info.instance.clone());
            groups.entry(info.group.clone()).or_default().insert(info.instance.clone());
            let entry = MemberEntry {
                connection: info.connection.clone(),
                group: info.group.clone(),
            };
            members.insert(info.instance.clone(), entry);
        }
        Self {
            servers,
            groups,
            members,
        }
    }

    pub fn servers(&self) -> &HashSet<ServerInstance> {
        &self.servers
    }

    pub fn groups(&self) -> &HashMap<String, HashSet<ServerInstance>> {
        &self.groups
    }

    pub fn servers_in_group(&self, group: &str) -> Option<&HashSet<ServerInstance>> {
        self.groups.get(group)
    }

    pub fn connection(&self, instance: &ServerInstance) -> Option<&TServerConnection> {
        self.members.get(instance).map(|entry| &entry.connection)
    }

    pub fn resource_group(&self, instance: &ServerInstance) -> Option<&str> {
        self.members.get(instance).map(|entry| entry.group.as_str())
    }

    pub fn contains(&self, instance: &ServerInstance) -> bool {
        self.servers.contains(instance)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
