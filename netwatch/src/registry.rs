use std::{collections::BTreeSet, fs, path::Path};

use aya::maps::{HashMap, MapData};
use netwatch_common::{InterfaceRegistry, MONITORED_IFS_CAPACITY};
use tracing::debug;

use crate::error::{Error, Result};

const SYSFS_NET: &str = "/sys/class/net";

/// Storage behind the monitored-interface set.
pub trait RegistryMap {
    fn insert(&mut self, ifindex: u32) -> Result<()>;
    fn remove(&mut self, ifindex: u32) -> Result<()>;
}

impl RegistryMap for HashMap<MapData, u32, u32> {
    fn insert(&mut self, ifindex: u32) -> Result<()> {
        HashMap::insert(self, ifindex, 1u32, 0)?;
        Ok(())
    }

    fn remove(&mut self, ifindex: u32) -> Result<()> {
        HashMap::remove(self, &ifindex)?;
        Ok(())
    }
}

/// Control-plane side of `MONITORED_IFS`. The only writer of the kernel
/// map; keeps a local copy of the membership so capacity is checked before
/// the kernel ever sees an insert.
pub struct MonitoredInterfaces<M> {
    map: M,
    members: BTreeSet<u32>,
}

impl<M: RegistryMap> MonitoredInterfaces<M> {
    pub fn new(map: M) -> Self {
        MonitoredInterfaces {
            map,
            members: BTreeSet::new(),
        }
    }

    /// Adds `ifindex`. Registering an index twice is a no-op.
    pub fn register(&mut self, ifindex: u32) -> Result<()> {
        if ifindex == 0 {
            return Err(Error::UnknownInterface(format!("ifindex {ifindex}")));
        }
        if self.members.contains(&ifindex) {
            return Ok(());
        }
        if self.members.len() >= MONITORED_IFS_CAPACITY as usize {
            return Err(Error::RegistryFull {
                capacity: MONITORED_IFS_CAPACITY,
            });
        }
        self.map.insert(ifindex)?;
        self.members.insert(ifindex);
        debug!(ifindex, "registered interface");
        Ok(())
    }

    pub fn unregister(&mut self, ifindex: u32) -> Result<()> {
        if !self.members.contains(&ifindex) {
            return Err(Error::NotRegistered(ifindex));
        }
        self.map.remove(ifindex)?;
        self.members.remove(&ifindex);
        debug!(ifindex, "unregistered interface");
        Ok(())
    }

    /// Unregisters everything, returning the indices that could not be
    /// removed from the map.
    pub fn clear(&mut self) -> Vec<(u32, Error)> {
        let members: Vec<u32> = self.members.iter().copied().collect();
        members
            .into_iter()
            .filter_map(|ifindex| self.unregister(ifindex).err().map(|e| (ifindex, e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<M> InterfaceRegistry for MonitoredInterfaces<M> {
    fn lookup(&self, ifindex: u32) -> bool {
        self.members.contains(&ifindex)
    }
}

/// Resolves an interface name through `/sys/class/net/<name>/ifindex`.
pub fn ifindex_of(name: &str) -> Result<u32> {
    ifindex_in(Path::new(SYSFS_NET), name)
}

fn ifindex_in(root: &Path, name: &str) -> Result<u32> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::UnknownInterface(name.to_string()));
    }
    let raw = fs::read_to_string(root.join(name).join("ifindex"))
        .map_err(|_| Error::UnknownInterface(name.to_string()))?;
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|&ifindex| ifindex > 0)
        .ok_or_else(|| Error::UnknownInterface(name.to_string()))
}
