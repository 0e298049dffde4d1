//! Port and connection topology.
//!
//! [`GraphManager`] owns every registered port and the connection table. Clients
//! (identified by [`RefNum`]) own ports; a connection always runs from an output
//! port to an input port.
//!
//! # Snapshots
//!
//! [`GraphManager::save`] produces a [`ConnectionState`]: a deep copy of the
//! connection table. [`GraphManager::restore`] consumes it, so one snapshot feeds
//! at most one restore. Save and restore are only meaningful when no client or
//! port is registered and no connection changes in between; nothing here locks
//! the graph across that window.
//!
//! # Realtime access
//!
//! The realtime thread only touches port buffers, through the `try_` methods,
//! which give up instead of waiting on a control-plane writer.

use crate::client::RefNum;
use crate::error::{EngineError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a registered port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u32);

impl PortId {
    /// Creates a port id from its raw value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a port, seen from its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Receives audio from connected outputs.
    Input,
    /// Provides audio to connected inputs.
    Output,
}

/// Public description of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port identifier.
    pub id: PortId,
    /// Full name, `client:port`.
    pub name: String,
    /// Owning client.
    pub owner: RefNum,
    /// Direction.
    pub direction: PortDirection,
    /// Whether the port corresponds to a hardware channel.
    pub physical: bool,
}

/// A connection from an output port to an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection {
    /// Output side.
    pub src: PortId,
    /// Input side.
    pub dst: PortId,
}

/// Deep copy of the connection table at one point in time.
///
/// Not `Clone`: a snapshot is consumed by the single [`GraphManager::restore`]
/// that uses it.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionState {
    connections: BTreeSet<Connection>,
}

impl ConnectionState {
    /// Number of saved connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the snapshot holds no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Saved connections in order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }
}

#[derive(Debug)]
struct Port {
    info: PortInfo,
    buffer: Vec<f32>,
}

#[derive(Debug)]
struct GraphState {
    ports: BTreeMap<PortId, Port>,
    connections: BTreeSet<Connection>,
    next_port: u32,
    buffer_size: u32,
    version: u64,
}

impl GraphState {
    fn port(&self, id: PortId) -> Result<&Port> {
        self.ports.get(&id).ok_or(EngineError::NoSuchPort(id))
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

/// Owner of the port and connection topology.
#[derive(Debug)]
pub struct GraphManager {
    state: RwLock<GraphState>,
}

impl GraphManager {
    /// Creates an empty graph whose port buffers hold `buffer_size` frames.
    pub fn new(buffer_size: u32) -> Self {
        Self {
            state: RwLock::new(GraphState {
                ports: BTreeMap::new(),
                connections: BTreeSet::new(),
                next_port: 1,
                buffer_size,
                version: 0,
            }),
        }
    }

    /// Registers a port named `full_name` owned by `owner`.
    pub fn allocate_port(
        &self,
        owner: RefNum,
        full_name: &str,
        direction: PortDirection,
        physical: bool,
    ) -> Result<PortId> {
        let mut state = self.state.write();
        if state.ports.values().any(|p| p.info.name == full_name) {
            return Err(EngineError::PortNameTaken(full_name.to_string()));
        }
        let id = PortId(state.next_port);
        state.next_port += 1;
        let buffer = vec![0.0; state.buffer_size as usize];
        state.ports.insert(
            id,
            Port {
                info: PortInfo {
                    id,
                    name: full_name.to_string(),
                    owner,
                    direction,
                    physical,
                },
                buffer,
            },
        );
        state.touch();
        Ok(id)
    }

    /// Removes a port owned by `owner`, together with its connections.
    pub fn release_port(&self, owner: RefNum, port: PortId) -> Result<()> {
        let mut state = self.state.write();
        let info = &state.port(port)?.info;
        if info.owner != owner {
            return Err(EngineError::NotPortOwner {
                port,
                refnum: owner,
            });
        }
        state.ports.remove(&port);
        state
            .connections
            .retain(|c| c.src != port && c.dst != port);
        state.touch();
        Ok(())
    }

    /// Removes every port owned by `owner`. Returns the removed ids.
    pub fn remove_all_ports(&self, owner: RefNum) -> Vec<PortId> {
        let mut state = self.state.write();
        let removed: Vec<PortId> = state
            .ports
            .values()
            .filter(|p| p.info.owner == owner)
            .map(|p| p.info.id)
            .collect();
        if removed.is_empty() {
            return removed;
        }
        for id in &removed {
            state.ports.remove(id);
        }
        state
            .connections
            .retain(|c| !removed.contains(&c.src) && !removed.contains(&c.dst));
        state.touch();
        removed
    }

    /// Connects output `src` to input `dst`.
    pub fn connect(&self, src: PortId, dst: PortId) -> Result<()> {
        let mut state = self.state.write();
        let src_dir = state.port(src)?.info.direction;
        let dst_dir = state.port(dst)?.info.direction;
        if src_dir != PortDirection::Output || dst_dir != PortDirection::Input {
            return Err(EngineError::IncompatiblePorts { src, dst });
        }
        if !state.connections.insert(Connection { src, dst }) {
            return Err(EngineError::ConnectionExists { src, dst });
        }
        state.touch();
        Ok(())
    }

    /// Removes the connection from `src` to `dst`.
    pub fn disconnect(&self, src: PortId, dst: PortId) -> Result<()> {
        let mut state = self.state.write();
        if !state.connections.remove(&Connection { src, dst }) {
            return Err(EngineError::NotConnected { src, dst });
        }
        state.touch();
        Ok(())
    }

    /// Removes every connection touching `port`. Returns the removed connections.
    pub fn disconnect_port(&self, port: PortId) -> Vec<Connection> {
        let mut state = self.state.write();
        let removed: Vec<Connection> = state
            .connections
            .iter()
            .filter(|c| c.src == port || c.dst == port)
            .copied()
            .collect();
        for c in &removed {
            state.connections.remove(c);
        }
        if !removed.is_empty() {
            state.touch();
        }
        removed
    }

    /// Removes every connection touching a port owned by `owner`.
    ///
    /// Returns the removed connections.
    pub fn disconnect_all_ports(&self, owner: RefNum) -> Vec<Connection> {
        let mut state = self.state.write();
        let owned: BTreeSet<PortId> = state
            .ports
            .values()
            .filter(|p| p.info.owner == owner)
            .map(|p| p.info.id)
            .collect();
        let removed: Vec<Connection> = state
            .connections
            .iter()
            .filter(|c| owned.contains(&c.src) || owned.contains(&c.dst))
            .copied()
            .collect();
        for c in &removed {
            state.connections.remove(c);
        }
        if !removed.is_empty() {
            state.touch();
        }
        removed
    }

    /// Deep copy of the current connection table.
    pub fn save(&self) -> ConnectionState {
        ConnectionState {
            connections: self.state.read().connections.clone(),
        }
    }

    /// Replaces the connection table with `snapshot`.
    ///
    /// Connections whose ports disappeared since the snapshot was taken are
    /// dropped. Returns the number of connections restored.
    pub fn restore(&self, snapshot: ConnectionState) -> usize {
        let mut state = self.state.write();
        let (kept, dangling): (BTreeSet<Connection>, BTreeSet<Connection>) = snapshot
            .connections
            .into_iter()
            .partition(|c| state.ports.contains_key(&c.src) && state.ports.contains_key(&c.dst));
        if !dangling.is_empty() {
            tracing::warn!(
                dropped = dangling.len(),
                "ports removed between save and restore; dropping their connections"
            );
        }
        state.connections = kept;
        state.touch();
        state.connections.len()
    }

    /// Whether `src` is connected to `dst`.
    pub fn is_connected(&self, src: PortId, dst: PortId) -> bool {
        self.state
            .read()
            .connections
            .contains(&Connection { src, dst })
    }

    /// All connections, in order.
    pub fn connections(&self) -> Vec<Connection> {
        self.state.read().connections.iter().copied().collect()
    }

    /// Number of connections.
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Number of registered ports.
    pub fn port_count(&self) -> usize {
        self.state.read().ports.len()
    }

    /// Description of a port.
    pub fn port(&self, id: PortId) -> Option<PortInfo> {
        self.state.read().ports.get(&id).map(|p| p.info.clone())
    }

    /// Finds a port by its full name.
    pub fn find_port(&self, full_name: &str) -> Option<PortInfo> {
        self.state
            .read()
            .ports
            .values()
            .find(|p| p.info.name == full_name)
            .map(|p| p.info.clone())
    }

    /// Ports owned by `owner`, in registration order.
    pub fn ports_of(&self, owner: RefNum) -> Vec<PortInfo> {
        self.state
            .read()
            .ports
            .values()
            .filter(|p| p.info.owner == owner)
            .map(|p| p.info.clone())
            .collect()
    }

    /// Every registered port.
    pub fn ports(&self) -> Vec<PortInfo> {
        self.state
            .read()
            .ports
            .values()
            .map(|p| p.info.clone())
            .collect()
    }

    /// Counter bumped on every structural change (ports or connections).
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Frames held by each port buffer.
    pub fn buffer_size(&self) -> u32 {
        self.state.read().buffer_size
    }

    /// Resizes every port buffer to `frames` and clears it.
    pub fn set_buffer_size(&self, frames: u32) {
        let mut state = self.state.write();
        state.buffer_size = frames;
        for port in state.ports.values_mut() {
            port.buffer.clear();
            port.buffer.resize(frames as usize, 0.0);
        }
    }

    /// Copies the buffer of `from` into `to` without waiting for the lock.
    ///
    /// Returns `false` if the graph was busy or either port is missing.
    pub fn try_copy_buffer(&self, from: PortId, to: PortId) -> bool {
        let Some(mut state) = self.state.try_write() else {
            return false;
        };
        let Some(source) = state.ports.get(&from).map(|p| p.buffer.clone()) else {
            return false;
        };
        match state.ports.get_mut(&to) {
            Some(target) => {
                let n = target.buffer.len().min(source.len());
                target.buffer[..n].copy_from_slice(&source[..n]);
                true
            }
            None => false,
        }
    }

    /// Writes `samples` into the buffer of `port` without waiting for the lock.
    pub fn try_write_buffer(&self, port: PortId, samples: &[f32]) -> bool {
        let Some(mut state) = self.state.try_write() else {
            return false;
        };
        match state.ports.get_mut(&port) {
            Some(p) => {
                let n = p.buffer.len().min(samples.len());
                p.buffer[..n].copy_from_slice(&samples[..n]);
                true
            }
            None => false,
        }
    }

    /// Reads the buffer of `port` into `out` without waiting for the lock.
    pub fn try_read_buffer(&self, port: PortId, out: &mut [f32]) -> bool {
        let Some(state) = self.state.try_read() else {
            return false;
        };
        match state.ports.get(&port) {
            Some(p) => {
                let n = p.buffer.len().min(out.len());
                out[..n].copy_from_slice(&p.buffer[..n]);
                true
            }
            None => false,
        }
    }

    /// Sums every output connected to input `port` into `out`.
    ///
    /// Returns `false` without touching `out` if the graph was busy.
    pub fn try_mix_input(&self, port: PortId, out: &mut [f32]) -> bool {
        let Some(state) = self.state.try_read() else {
            return false;
        };
        out.fill(0.0);
        for c in state.connections.iter().filter(|c| c.dst == port) {
            if let Some(src) = state.ports.get(&c.src) {
                for (o, s) in out.iter_mut().zip(src.buffer.iter()) {
                    *o += *s;
                }
            }
        }
        true
    }
}

impl Default for GraphManager {
    fn default() -> Self {
        Self::new(crate::control::DEFAULT_BUFFER_SIZE)
    }
}
