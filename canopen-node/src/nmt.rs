//! The NMT coordinator (C5): node state machine, heartbeat producer/consumer, and SYNC producer.
//!
//! All three services share one poll loop, the same way [`crate::pdo::PdoEngine`] ticks its
//! inhibit/event timers: comm parameters (0x1005, 0x1006, 0x1016, 0x1017, 0x1019) are read fresh
//! from the OD on every tick rather than cached, so an SDO write to any of them takes effect on
//! the next tick without a restart. Producing EMCY frames for a heartbeat-consumer timeout is out
//! of scope (see module docs in SPEC_FULL); this module only raises the internal [`EmcyEvent`] so
//! a node wrapper can act on it (log it, eventually build the EMCY frame itself).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopen_common::messages::{
    CanId, CanMessage, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState, SyncObject,
    HEARTBEAT_ID, NMT_CMD_ID,
};
use canopen_common::object_ids;
use log::{info, warn};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::{CanBus, CanTransport};
use crate::od::ObjectDictionary;
use crate::pdo::PdoEngine;

/// Poll period for the heartbeat/SYNC producers and the heartbeat consumer table.
const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Depth of the EMCY event fanout. A handful of pending consumer timeouts is already an unusual
/// network; this is not meant to buffer indefinitely.
const EMCY_CHANNEL_CAPACITY: usize = 32;

/// EMCY error code for "heartbeat event" (CiA 301 Table 12), raised when a monitored node's
/// heartbeat consumer time elapses with nothing received.
const HEARTBEAT_CONSUMER_TIMEOUT_CODE: u16 = 0x8130;

/// An EMCY-worthy condition raised by the NMT coordinator itself, rather than received off the
/// bus. See the module docs for why this stops short of emitting an actual EMCY frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmcyEvent {
    /// The CiA 301 error code (Table 12) this event corresponds to.
    pub code: u16,
    /// The remote node id the event concerns.
    pub node_id: u8,
}

struct ConsumerState {
    node_id: u8,
    timeout: Duration,
    last_seen: Instant,
    notified: bool,
}

/// The NMT coordinator for one node: owns the node's [`NmtState`], produces heartbeats and SYNC,
/// and watches configured remote nodes' heartbeats.
pub struct Nmt<T: CanTransport> {
    od: Arc<ObjectDictionary>,
    bus: Arc<CanBus<T>>,
    pdo: Arc<PdoEngine<T>>,
    node_id: u8,
    state_tx: watch::Sender<NmtState>,
    emcy_tx: broadcast::Sender<EmcyEvent>,
    last_heartbeat_sent: Mutex<Option<Instant>>,
    last_sync_sent: Mutex<Option<Instant>>,
    sync_counter: Mutex<u8>,
    consumers: Mutex<Vec<ConsumerState>>,
}

impl<T: CanTransport> Nmt<T> {
    /// Build the coordinator and run the boot-up sequence: transmit the boot-up frame
    /// (a heartbeat with state `Initialising`), then move to `PreOperational`. `state_tx` is
    /// shared with every other component that needs to know the current NMT state (the PDO
    /// engine, the SDO server); this coordinator is the only writer.
    pub async fn start(
        od: Arc<ObjectDictionary>,
        bus: Arc<CanBus<T>>,
        pdo: Arc<PdoEngine<T>>,
        node_id: u8,
        state_tx: watch::Sender<NmtState>,
    ) -> Arc<Self> {
        let (emcy_tx, _) = broadcast::channel(EMCY_CHANNEL_CAPACITY);
        let nmt = Arc::new(Self {
            od,
            bus,
            pdo,
            node_id,
            state_tx,
            emcy_tx,
            last_heartbeat_sent: Mutex::new(None),
            last_sync_sent: Mutex::new(None),
            sync_counter: Mutex::new(0),
            consumers: Mutex::new(Vec::new()),
        });

        nmt.reload_consumers().await;
        nmt.install_consumer_hook().await;
        nmt.boot_sequence().await;
        nmt
    }

    /// Subscribe to EMCY-worthy events raised internally (currently: heartbeat consumer timeout).
    pub fn subscribe_emcy(&self) -> broadcast::Receiver<EmcyEvent> {
        self.emcy_tx.subscribe()
    }

    /// Current NMT state.
    pub fn state(&self) -> NmtState {
        *self.state_tx.borrow()
    }

    async fn boot_sequence(&self) {
        self.state_tx.send_replace(NmtState::Initialising);
        self.send_heartbeat().await;
        self.state_tx.send_replace(NmtState::PreOperational);
        // Force a fresh heartbeat to go out promptly once ticking resumes, rather than waiting a
        // full producer period after the boot-up frame.
        *self.last_heartbeat_sent.lock().unwrap() = None;
    }

    async fn send_heartbeat(&self) {
        let hb = Heartbeat {
            node: self.node_id,
            state: self.state(),
        };
        let msg: CanMessage = hb.into();
        if let Err(e) = self.bus.send(msg).await {
            warn!("NMT coordinator on node {}: failed to send heartbeat: {e}", self.node_id);
        }
        *self.last_heartbeat_sent.lock().unwrap() = Some(Instant::now());
    }

    async fn reload_consumers(&self) {
        let count = self
            .od
            .read(object_ids::CONSUMER_HEARTBEAT_TIME, 0)
            .await
            .ok()
            .and_then(|d| d.first().copied())
            .unwrap_or(0);

        let mut list = Vec::new();
        for sub in 1..=count {
            let Ok(data) = self.od.read(object_ids::CONSUMER_HEARTBEAT_TIME, sub).await else { continue };
            let Ok(raw) = data.as_slice().try_into().map(u32::from_le_bytes) else { continue };
            let node_id = (raw >> 16) as u8;
            let time_ms = (raw & 0xFFFF) as u16;
            if node_id != 0 && time_ms != 0 {
                list.push(ConsumerState {
                    node_id,
                    timeout: Duration::from_millis(time_ms as u64),
                    last_seen: Instant::now(),
                    notified: false,
                });
            }
        }
        *self.consumers.lock().unwrap() = list;
    }

    async fn install_consumer_hook(self: &Arc<Self>) {
        let me = self.clone();
        let _ = self
            .od
            .subscribe_write(object_ids::CONSUMER_HEARTBEAT_TIME, 0, move |_| {
                let me = me.clone();
                tokio::spawn(async move {
                    me.reload_consumers().await;
                });
            })
            .await;
    }

    /// Drive the producer/consumer ticks and handle NMT commands and remote heartbeats off the
    /// bus. Runs until the bus channel closes; meant to be spawned as its own task.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(msg) => self.handle_bus_message(msg).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.tick_heartbeat_producer().await;
                    self.tick_sync_producer().await;
                    self.tick_heartbeat_consumers();
                }
            }
        }
    }

    async fn handle_bus_message(&self, msg: CanMessage) {
        if msg.id() == NMT_CMD_ID {
            if let Ok(cmd) = NmtCommand::try_from(msg) {
                if cmd.node == 0 || cmd.node == self.node_id {
                    self.handle_command(cmd.cs).await;
                }
            }
            return;
        }

        let raw = msg.id().raw();
        if (HEARTBEAT_ID as u32..HEARTBEAT_ID as u32 + 128).contains(&raw) {
            let node_id = (raw - HEARTBEAT_ID as u32) as u8;
            self.note_heartbeat(node_id);
        }
    }

    fn note_heartbeat(&self, node_id: u8) {
        let mut consumers = self.consumers.lock().unwrap();
        for c in consumers.iter_mut() {
            if c.node_id == node_id {
                c.last_seen = Instant::now();
                c.notified = false;
            }
        }
    }

    async fn handle_command(&self, cs: NmtCommandSpecifier) {
        info!("NMT coordinator on node {}: received {cs:?}", self.node_id);
        match cs {
            NmtCommandSpecifier::Start => {
                self.state_tx.send_replace(NmtState::Operational);
            }
            NmtCommandSpecifier::Stop => {
                self.state_tx.send_replace(NmtState::Stopped);
            }
            NmtCommandSpecifier::EnterPreOp => {
                self.state_tx.send_replace(NmtState::PreOperational);
            }
            NmtCommandSpecifier::ResetApp => {
                self.od.reset_application().await;
                self.pdo.reload().await;
                self.reload_consumers().await;
                self.boot_sequence().await;
                self.state_tx.send_replace(NmtState::Operational);
            }
            NmtCommandSpecifier::ResetComm => {
                self.od.reset_communication().await;
                self.pdo.reload().await;
                self.reload_consumers().await;
                self.boot_sequence().await;
                self.state_tx.send_replace(NmtState::Operational);
            }
        }
    }

    async fn tick_heartbeat_producer(&self) {
        let period_ms = self
            .od
            .read(object_ids::HEARTBEAT_PRODUCER_TIME, 0)
            .await
            .ok()
            .and_then(|d| d.as_slice().try_into().ok())
            .map(u16::from_le_bytes)
            .unwrap_or(0);
        if period_ms == 0 {
            return;
        }
        let period = Duration::from_millis(period_ms as u64);
        let due = match *self.last_heartbeat_sent.lock().unwrap() {
            Some(last) => last.elapsed() >= period,
            None => true,
        };
        if due {
            self.send_heartbeat().await;
        }
    }

    async fn tick_sync_producer(&self) {
        let Ok(data) = self.od.read(object_ids::COB_ID_SYNC, 0).await else { return };
        let Ok(cob_raw) = data.as_slice().try_into().map(u32::from_le_bytes) else { return };
        if cob_raw & 0x4000_0000 == 0 {
            // Bit 30: SYNC producer enable.
            return;
        }

        let period_us = self
            .od
            .read(object_ids::COMMUNICATION_CYCLE_PERIOD, 0)
            .await
            .ok()
            .and_then(|d| d.as_slice().try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(0);
        if period_us == 0 {
            return;
        }
        let period = Duration::from_micros(period_us as u64);
        let due = match *self.last_sync_sent.lock().unwrap() {
            Some(last) => last.elapsed() >= period,
            None => true,
        };
        if !due {
            return;
        }

        let overflow = self
            .od
            .read(object_ids::SYNC_COUNTER_OVERFLOW, 0)
            .await
            .ok()
            .and_then(|d| d.first().copied())
            .unwrap_or(0);
        let count = if overflow > 0 {
            let mut counter = self.sync_counter.lock().unwrap();
            *counter = if *counter >= overflow { 1 } else { *counter + 1 };
            Some(*counter)
        } else {
            None
        };

        let cob_id = CanId::Std((cob_raw & 0x7FF) as u16);
        self.pdo.fire_sync(SyncObject::new(cob_id, count)).await;
        *self.last_sync_sent.lock().unwrap() = Some(Instant::now());
    }

    fn tick_heartbeat_consumers(&self) {
        let mut consumers = self.consumers.lock().unwrap();
        for c in consumers.iter_mut() {
            if !c.notified && c.last_seen.elapsed() >= c.timeout {
                c.notified = true;
                warn!(
                    "NMT coordinator on node {}: heartbeat consumer timeout for node {}",
                    self.node_id, c.node_id
                );
                let _ = self.emcy_tx.send(EmcyEvent {
                    code: HEARTBEAT_CONSUMER_TIMEOUT_CODE,
                    node_id: c.node_id,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackTransport;
    use canopen_eds::ElectronicDataSheet;

    const TEST_EDS: &str = include_str!("../../canopen-eds/src/example.eds");

    async fn test_setup(
        state_tx: watch::Sender<NmtState>,
    ) -> (Arc<ObjectDictionary>, Arc<CanBus<LoopbackTransport>>, Arc<PdoEngine<LoopbackTransport>>) {
        let eds = ElectronicDataSheet::from_str(TEST_EDS).unwrap();
        let od = ObjectDictionary::from_eds(&eds);
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let pdo = PdoEngine::start(od.clone(), bus.clone(), 5, state_tx.subscribe()).await;
        (od, bus, pdo)
    }

    #[tokio::test]
    async fn boot_sequence_sends_bootup_then_moves_to_preop() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Initialising);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        let mut rx = bus.subscribe();

        let nmt = Nmt::start(od, bus, pdo, 5, state_tx).await;

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.data()[0], NmtState::Initialising as u8);
        assert_eq!(nmt.state(), NmtState::PreOperational);
    }

    #[tokio::test]
    async fn start_command_transitions_to_operational() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Initialising);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        let nmt = Nmt::start(od, bus.clone(), pdo, 5, state_tx).await;
        tokio::spawn(nmt.clone().run());

        bus.send(NmtCommand { cs: NmtCommandSpecifier::Start, node: 5 }.into()).await.unwrap();
        // Give the spawned run() task a chance to process the frame.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(nmt.state(), NmtState::Operational);
    }

    #[tokio::test]
    async fn broadcast_stop_command_applies_to_every_node() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Operational);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        let nmt = Nmt::start(od, bus.clone(), pdo, 5, state_tx).await;
        tokio::spawn(nmt.clone().run());

        bus.send(NmtCommand { cs: NmtCommandSpecifier::Stop, node: 0 }.into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(nmt.state(), NmtState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_producer_sends_on_configured_period() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Operational);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        od.write(object_ids::HEARTBEAT_PRODUCER_TIME, 0, &100u16.to_le_bytes()).await.unwrap();
        let nmt = Nmt::start(od, bus.clone(), pdo, 5, state_tx).await;
        let mut rx = bus.subscribe();
        tokio::spawn(nmt.run());

        tokio::time::advance(Duration::from_millis(150)).await;
        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.id().raw(), HEARTBEAT_ID as u32 | 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_producer_sends_counter_when_overflow_configured() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Operational);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        od.write(object_ids::COB_ID_SYNC, 0, &0x4000_0080u32.to_le_bytes()).await.unwrap();
        // 0x1019 can only be written while the cycle period is still zero.
        od.write(object_ids::SYNC_COUNTER_OVERFLOW, 0, &[10]).await.unwrap();
        od.write(object_ids::COMMUNICATION_CYCLE_PERIOD, 0, &10_000u32.to_le_bytes()).await.unwrap();
        let nmt = Nmt::start(od, bus.clone(), pdo, 5, state_tx).await;
        let mut rx = bus.subscribe();
        tokio::spawn(nmt.run());

        tokio::time::advance(Duration::from_millis(15)).await;
        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.id(), CanId::Std(0x80));
        assert_eq!(msg.data(), &[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_consumer_timeout_raises_emcy_event() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Operational);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        od.write(object_ids::CONSUMER_HEARTBEAT_TIME, 0, &[1]).await.unwrap();
        // node 9, 50 ms timeout: (9 << 16) | 50
        od.write(object_ids::CONSUMER_HEARTBEAT_TIME, 1, &((9u32 << 16) | 50).to_le_bytes()).await.unwrap();
        let nmt = Nmt::start(od, bus, pdo, 5, state_tx).await;
        let mut emcy_rx = nmt.subscribe_emcy();
        tokio::spawn(nmt.run());

        tokio::time::advance(Duration::from_millis(100)).await;
        let event = tokio::time::timeout(Duration::from_millis(50), emcy_rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, EmcyEvent { code: HEARTBEAT_CONSUMER_TIMEOUT_CODE, node_id: 9 });
    }

    #[tokio::test]
    async fn reset_app_restores_defaults_and_rewalks_bootup() {
        let (state_tx, _state_rx) = watch::channel(NmtState::Operational);
        let (od, bus, pdo) = test_setup(state_tx.clone()).await;
        od.write(0x2001, 0, &[0x42]).await.unwrap();
        let nmt = Nmt::start(od.clone(), bus.clone(), pdo, 5, state_tx).await;
        tokio::spawn(nmt.clone().run());
        let mut rx = bus.subscribe();

        bus.send(NmtCommand { cs: NmtCommandSpecifier::ResetApp, node: 5 }.into()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.data()[0], NmtState::Initialising as u8);
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![0]);
        assert_eq!(nmt.state(), NmtState::Operational);
    }
}
