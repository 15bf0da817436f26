use std::net::SocketAddr;

use crate::config::TopologyConfig;
use crate::error::RudpError;
use crate::mesh::Mesh;
use crate::node::Node;

/// One process's view of the network: the node it plays as, plus the mesh
/// when it is also hosting.
pub struct Engine {
    node: Node,
    mesh: Mesh,
}

impl Engine {
    pub fn new(config: TopologyConfig, max_nodes: usize) -> Result<Self, RudpError> {
        Ok(Self {
            node: Node::new(config.clone())?,
            mesh: Mesh::new(config, max_nodes)?,
        })
    }

    /// Starts accepting nodes on `bind_addr`, returning the bound address
    pub async fn host_network(&mut self, bind_addr: SocketAddr) -> Result<SocketAddr, RudpError> {
        self.mesh.start(bind_addr).await?;
        self.mesh.local_addr().ok_or(RudpError::NotRunning)
    }

    /// Starts the local node on `bind_addr` and begins joining the mesh at `mesh_addr`
    pub async fn join_network(
        &mut self,
        bind_addr: SocketAddr,
        mesh_addr: SocketAddr,
    ) -> Result<(), RudpError> {
        if !self.node.is_running() {
            self.node.start(bind_addr).await?;
        }
        self.node.connect(mesh_addr);
        Ok(())
    }

    /// Node first, then mesh. Slots the mesh timed out this tick are dropped on the node too.
    pub async fn update(&mut self, delta_time: f32) -> Result<(), RudpError> {
        self.node.update(delta_time).await?;

        if self.mesh.is_running() {
            self.mesh.update(delta_time).await?;
            for node_id in self.mesh.drain_timed_out() {
                if self.node.is_running() && self.node.is_node_connected(node_id) {
                    self.node.disconnect_node(node_id);
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.node.stop();
        self.mesh.stop();
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut Mesh {
        &mut self.mesh
    }
}
