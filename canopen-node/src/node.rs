//! The node (entry point): wires the object dictionary, bus, SDO server, PDO engine and NMT
//! coordinator for one node id and supervises them as a unit.

use std::sync::Arc;

use canopen_common::messages::NmtState;
use canopen_common::node_id::NodeId;
use canopen_eds::ElectronicDataSheet;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{CanBus, CanTransport};
use crate::error::NodeError;
use crate::nmt::Nmt;
use crate::od::ObjectDictionary;
use crate::pdo::PdoEngine;
use crate::sdo_server::SdoServer;

/// A fully wired CANopen device stack for one node id.
///
/// Construction (`new`) loads the EDS, builds the object dictionary, and starts every component
/// up through its boot-up sequence; `run` then spawns each component's service loop and blocks
/// until told to shut down.
pub struct Node<T: CanTransport> {
    /// The live object dictionary.
    pub od: Arc<ObjectDictionary>,
    /// The shared CAN bus handle.
    pub bus: Arc<CanBus<T>>,
    /// The PDO engine.
    pub pdo: Arc<PdoEngine<T>>,
    /// The NMT coordinator.
    pub nmt: Arc<Nmt<T>>,
    sdo: Option<SdoServer<T>>,
    node_id: u8,
}

impl<T: CanTransport> Node<T> {
    /// Load `eds_str`, build the object dictionary, and bring every component up to its boot-up
    /// state on `transport`. Fails if `eds_str` does not parse, `node_id` is not a legal CANopen
    /// node id (1-127), or `node_id` is the unconfigured value (255): a node cannot run the
    /// protocol stack without one.
    pub async fn new(eds_str: &str, node_id: u8, transport: T) -> Result<Self, NodeError> {
        let node_id = NodeId::new(node_id).map_err(|source| NodeError::InvalidNodeId { source })?;
        let node_id = match node_id {
            NodeId::Configured(id) => id.raw(),
            NodeId::Unconfigured => return Err(NodeError::UnconfiguredNodeId),
        };

        let eds = ElectronicDataSheet::from_str(eds_str).map_err(|source| NodeError::Eds { source })?;
        let od = ObjectDictionary::from_eds(&eds);
        let bus = Arc::new(CanBus::new(transport));

        let (state_tx, state_rx) = watch::channel(NmtState::Initialising);
        let pdo = PdoEngine::start(od.clone(), bus.clone(), node_id, state_rx.clone()).await;
        let sdo = SdoServer::new(od.clone(), bus.clone(), node_id).with_nmt_state(state_rx);
        let nmt = Nmt::start(od.clone(), bus.clone(), pdo.clone(), node_id, state_tx).await;

        Ok(Self {
            od,
            bus,
            pdo,
            nmt,
            sdo: Some(sdo),
            node_id,
        })
    }

    /// This node's configured node id.
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Current NMT state.
    pub fn state(&self) -> NmtState {
        self.nmt.state()
    }

    /// Spawn every component's service loop and run until `shutdown` reports `true`, then abort
    /// them. A clean shutdown does not attempt to flush in-flight transfers: CiA 301 has no
    /// "graceful disconnect" message, so there is nothing to wait for beyond stopping the loops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let sdo = self.sdo.take().expect("SdoServer already taken by a previous run()");

        let sdo_task: JoinHandle<()> = tokio::spawn(sdo.run());
        let pdo_task: JoinHandle<()> = tokio::spawn(self.pdo.clone().run());
        let nmt_task: JoinHandle<()> = tokio::spawn(self.nmt.clone().run());

        let _ = shutdown.wait_for(|stop| *stop).await;

        sdo_task.abort();
        pdo_task.abort();
        nmt_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackTransport;
    use canopen_common::sdo::{SdoRequest, SdoResponse};

    const TEST_EDS: &str = include_str!("../../canopen-eds/src/example.eds");

    #[tokio::test]
    async fn new_rejects_unconfigured_node_id() {
        let err = Node::new(TEST_EDS, 255, LoopbackTransport::default()).await.unwrap_err();
        assert!(matches!(err, NodeError::UnconfiguredNodeId));
    }

    #[tokio::test]
    async fn new_rejects_illegal_node_id() {
        let err = Node::new(TEST_EDS, 200, LoopbackTransport::default()).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidNodeId { .. }));
    }

    #[tokio::test]
    async fn new_rejects_malformed_eds() {
        let err = Node::new("not an eds file", 5, LoopbackTransport::default()).await.unwrap_err();
        assert!(matches!(err, NodeError::Eds { .. }));
    }

    #[tokio::test]
    async fn run_serves_sdo_until_shutdown() {
        let node = Node::new(TEST_EDS, 5, LoopbackTransport::default()).await.unwrap();
        let bus = node.bus.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_task = tokio::spawn(node.run(shutdown_rx));

        let mut rx = bus.subscribe();
        bus.send(SdoRequest::expedited_download(0x2001, 0, &[0x9]).to_can_message(canopen_common::CanId::Std(0x605)))
            .await
            .unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(SdoResponse::try_from(msg), Ok(SdoResponse::ConfirmDownload { index: 0x2001, sub: 0 })));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(100), run_task).await.unwrap().unwrap();
    }
}
