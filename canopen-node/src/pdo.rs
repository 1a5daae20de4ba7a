//! The PDO engine (C4): mapped process data, transmitted and received under several disciplines.
//!
//! Mapping and communication parameters live in the OD at the standard 0x1400-0x1BFF range; this
//! engine reads them once at [`PdoEngine::start`] and keeps them live via `subscribe_write` so a
//! runtime SDO reconfiguration (disable, remap, retime) takes effect without a restart.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canopen_common::messages::{CanId, CanMessage, NmtState, SyncObject, SYNC_ID};
use canopen_common::object_ids;
use canopen_common::sdo::AbortCode;
use log::warn;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::bus::{CanBus, CanTransport};
use crate::od::ObjectDictionary;

/// One (index, subindex, bit_length) slot of a PDO mapping.
#[derive(Clone, Copy, Debug)]
struct MappedEntry {
    index: u16,
    sub: u8,
    bit_len: u8,
}

fn decode_mapping_entry(raw: u32) -> MappedEntry {
    MappedEntry {
        index: (raw >> 16) as u16,
        sub: ((raw >> 8) & 0xFF) as u8,
        bit_len: (raw & 0xFF) as u8,
    }
}

async fn read_mapping(od: &ObjectDictionary, mapping_index: u16) -> Vec<MappedEntry> {
    let count = od.read(mapping_index, 0).await.ok().and_then(|d| d.first().copied()).unwrap_or(0);
    let mut out = Vec::new();
    for sub in 1..=count {
        let Ok(data) = od.read(mapping_index, sub).await else { break };
        let Ok(raw) = data.as_slice().try_into().map(u32::from_le_bytes) else { break };
        let entry = decode_mapping_entry(raw);
        if entry.index != 0 {
            out.push(entry);
        }
    }
    out
}

fn bytes_to_u64(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = data.len().min(8);
    buf[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(buf)
}

fn bit_mask(bit_len: u8) -> u64 {
    if bit_len >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_len) - 1
    }
}

async fn pack_payload(od: &ObjectDictionary, mapping: &[MappedEntry]) -> Result<Vec<u8>, AbortCode> {
    let mut bits: u64 = 0;
    let mut offset: u32 = 0;
    for entry in mapping {
        let data = od.read(entry.index, entry.sub).await?;
        let value = bytes_to_u64(&data) & bit_mask(entry.bit_len);
        bits |= value << offset;
        offset += entry.bit_len as u32;
    }
    let byte_len = offset.div_ceil(8) as usize;
    Ok(bits.to_le_bytes()[..byte_len.max(1).min(8)].to_vec())
}

fn unpack_payload(data: &[u8], mapping: &[MappedEntry]) -> Vec<(u16, u8, Vec<u8>)> {
    let bits = bytes_to_u64(data);
    let mut offset: u32 = 0;
    let mut out = Vec::with_capacity(mapping.len());
    for entry in mapping {
        let value = (bits >> offset) & bit_mask(entry.bit_len);
        let byte_len = (entry.bit_len as usize).div_ceil(8).max(1);
        out.push((entry.index, entry.sub, value.to_le_bytes()[..byte_len.min(8)].to_vec()));
        offset += entry.bit_len as u32;
    }
    out
}

/// Transmission discipline decoded from the comm parameter's trans_type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransType {
    /// Acyclic: send once on the next SYNC after a mapped value changes.
    Acyclic,
    /// Cyclic: send every Nth SYNC.
    Cyclic(u8),
    /// RTR-triggered (252/253): send in response to a matching remote frame.
    Rtr,
    /// Event-driven (254/255 both collapse here; see §4.4).
    EventDriven,
}

impl TransType {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => TransType::Acyclic,
            1..=240 => TransType::Cyclic(b),
            252 | 253 => TransType::Rtr,
            _ => TransType::EventDriven,
        }
    }
}

struct TpdoSlot {
    cob_id: AtomicU32,
    trans_type: Mutex<TransType>,
    inhibit: Mutex<Duration>,
    event_timer: Mutex<Duration>,
    sync_start: Mutex<u8>,
    mapping: Mutex<Vec<MappedEntry>>,
    dirty: AtomicBool,
    sync_count: AtomicU32,
    last_sent: Mutex<Option<Instant>>,
    last_payload: Mutex<Option<Vec<u8>>>,
}

impl TpdoSlot {
    fn new() -> Self {
        Self {
            cob_id: AtomicU32::new(0x8000_0000),
            trans_type: Mutex::new(TransType::EventDriven),
            inhibit: Mutex::new(Duration::ZERO),
            event_timer: Mutex::new(Duration::ZERO),
            sync_start: Mutex::new(0),
            mapping: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(true),
            sync_count: AtomicU32::new(0),
            last_sent: Mutex::new(None),
            last_payload: Mutex::new(None),
        }
    }

    fn enabled(&self) -> bool {
        self.cob_id.load(Ordering::Relaxed) & 0x8000_0000 == 0
    }

    /// Bit 30: RTR allowed for this TPDO when clear; set means RTR is disabled (§3).
    fn rtr_allowed(&self) -> bool {
        self.cob_id.load(Ordering::Relaxed) & 0x4000_0000 == 0
    }
}

struct RpdoSlot {
    cob_id: AtomicU32,
    trans_type: Mutex<TransType>,
    mapping: Mutex<Vec<MappedEntry>>,
    pending: Mutex<Option<Vec<(u16, u8, Vec<u8>)>>>,
}

impl RpdoSlot {
    fn new() -> Self {
        Self {
            cob_id: AtomicU32::new(0x8000_0000),
            trans_type: Mutex::new(TransType::EventDriven),
            mapping: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
        }
    }

    fn enabled(&self) -> bool {
        self.cob_id.load(Ordering::Relaxed) & 0x8000_0000 == 0
    }
}

/// The PDO engine: owns every TPDO/RPDO slot's live configuration and runs the transmit/receive
/// loop for one node.
pub struct PdoEngine<T: CanTransport> {
    od: Arc<ObjectDictionary>,
    bus: Arc<CanBus<T>>,
    node_id: u8,
    tpdo: [Arc<TpdoSlot>; object_ids::NUM_PDOS as usize],
    rpdo: [Arc<RpdoSlot>; object_ids::NUM_PDOS as usize],
    nmt_state: watch::Receiver<NmtState>,
}

/// Poll period for inhibit/event-timer bookkeeping; short enough not to blur the 100 us inhibit
/// unit in practice (inhibit times used in CiA 301 deployments are nearly always >= 1 ms).
const TICK_PERIOD: Duration = Duration::from_millis(1);

impl<T: CanTransport> PdoEngine<T> {
    /// Load every TPDO/RPDO's comm/mapping parameters from the OD and wire up change
    /// notifications, returning a handle ready for [`Self::run`]. `nmt_state` gates PDO traffic:
    /// the engine only transmits and commits data while the node reports Operational.
    pub async fn start(
        od: Arc<ObjectDictionary>,
        bus: Arc<CanBus<T>>,
        node_id: u8,
        nmt_state: watch::Receiver<NmtState>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            od: od.clone(),
            bus,
            node_id,
            tpdo: std::array::from_fn(|_| Arc::new(TpdoSlot::new())),
            rpdo: std::array::from_fn(|_| Arc::new(RpdoSlot::new())),
            nmt_state,
        });

        for i in 0..object_ids::NUM_PDOS as u8 {
            engine.load_tpdo_values(i).await;
            engine.load_rpdo_values(i).await;
        }
        // Hooks are installed once, after the initial load, so a reconfiguration reload never
        // re-subscribes itself: `subscribe_write` has no matching unsubscribe, so doing this
        // inside the reload path would grow the callback list without bound.
        for i in 0..object_ids::NUM_PDOS as u8 {
            engine.install_tpdo_hooks(i).await;
        }

        engine
    }

    async fn load_tpdo_values(&self, i: u8) {
        let comm = object_ids::TPDO_COMM_BASE + i as u16 * 0x100;
        let mapping_idx = object_ids::TPDO_MAPPING_BASE + i as u16 * 0x100;
        let slot = &self.tpdo[i as usize];

        if let Ok(data) = self.od.read(comm, 1).await {
            slot.cob_id.store(u32::from_le_bytes(data.try_into().unwrap_or_default()), Ordering::Relaxed);
        }
        if let Ok(data) = self.od.read(comm, 2).await {
            *slot.trans_type.lock().unwrap() = TransType::from_byte(*data.first().unwrap_or(&254));
        }
        if let Ok(data) = self.od.read(comm, 3).await {
            let units = u16::from_le_bytes(data.try_into().unwrap_or_default());
            *slot.inhibit.lock().unwrap() = Duration::from_micros(units as u64 * 100);
        }
        if let Ok(data) = self.od.read(comm, 5).await {
            let ms = u16::from_le_bytes(data.try_into().unwrap_or_default());
            *slot.event_timer.lock().unwrap() = Duration::from_millis(ms as u64);
        }
        if let Ok(data) = self.od.read(comm, 6).await {
            *slot.sync_start.lock().unwrap() = *data.first().unwrap_or(&0);
        }
        *slot.mapping.lock().unwrap() = read_mapping(&self.od, mapping_idx).await;
    }

    async fn install_tpdo_hooks(self: &Arc<Self>, i: u8) {
        let comm = object_ids::TPDO_COMM_BASE + i as u16 * 0x100;
        let mapping_idx = object_ids::TPDO_MAPPING_BASE + i as u16 * 0x100;
        let slot = self.tpdo[i as usize].clone();

        let mapping = slot.mapping.lock().unwrap().clone();
        for entry in mapping {
            let slot = slot.clone();
            let _ = self
                .od
                .subscribe_write(entry.index, entry.sub, move |_| {
                    slot.dirty.store(true, Ordering::Relaxed);
                })
                .await;
        }

        let reload = {
            let me = self.clone();
            move |_: &[u8]| {
                let me = me.clone();
                tokio::spawn(async move {
                    me.load_tpdo_values(i).await;
                });
            }
        };
        let _ = self.od.subscribe_write(comm, 1, reload.clone()).await;
        let _ = self.od.subscribe_write(comm, 2, reload.clone()).await;
        let _ = self.od.subscribe_write(mapping_idx, 0, reload).await;
    }

    async fn load_rpdo_values(&self, i: u8) {
        let comm = object_ids::RPDO_COMM_BASE + i as u16 * 0x100;
        let mapping_idx = object_ids::RPDO_MAPPING_BASE + i as u16 * 0x100;
        let slot = &self.rpdo[i as usize];

        if let Ok(data) = self.od.read(comm, 1).await {
            slot.cob_id.store(u32::from_le_bytes(data.try_into().unwrap_or_default()), Ordering::Relaxed);
        }
        if let Ok(data) = self.od.read(comm, 2).await {
            *slot.trans_type.lock().unwrap() = TransType::from_byte(*data.first().unwrap_or(&254));
        }
        *slot.mapping.lock().unwrap() = read_mapping(&self.od, mapping_idx).await;
    }

    /// PDOs are only live while the node is in the Operational state (§4.4, §5).
    fn operational(&self) -> bool {
        *self.nmt_state.borrow() == NmtState::Operational
    }

    async fn send_tpdo(&self, i: usize) {
        if !self.operational() {
            return;
        }
        let slot = &self.tpdo[i];
        if !slot.enabled() {
            return;
        }
        let mapping = slot.mapping.lock().unwrap().clone();
        if mapping.is_empty() {
            return;
        }
        let inhibit = *slot.inhibit.lock().unwrap();
        if let Some(last) = *slot.last_sent.lock().unwrap() {
            if last.elapsed() < inhibit {
                return;
            }
        }
        match pack_payload(&self.od, &mapping).await {
            Ok(payload) => {
                let cob = CanId::Std((slot.cob_id.load(Ordering::Relaxed) & 0x7FF) as u16);
                let msg = CanMessage::new(cob, &payload);
                if let Err(e) = self.bus.send(msg).await {
                    warn!("PDO engine on node {}: failed to send TPDO{}: {e}", self.node_id, i + 1);
                }
                *slot.last_sent.lock().unwrap() = Some(Instant::now());
                *slot.last_payload.lock().unwrap() = Some(payload);
                slot.dirty.store(false, Ordering::Relaxed);
            }
            Err(code) => {
                warn!("PDO engine on node {}: could not build TPDO{} payload: {code:?}", self.node_id, i + 1);
            }
        }
    }

    /// Tick every TPDO/RPDO for one SYNC event: advance sync counters, transmit cyclic/acyclic
    /// TPDOs that are due, and commit any pending sync-triggered RPDO writes.
    ///
    /// `counter` is the global SYNC counter value carried on the wire, when the producer has
    /// counter support enabled (0x1019 != 0). A TPDO whose sync_start_value is non-zero only
    /// starts counting once `counter` reaches it; without a wire counter, cyclic TPDOs just count
    /// SYNC events as they arrive.
    async fn on_sync(&self, counter: Option<u8>) {
        if !self.operational() {
            return;
        }
        for i in 0..self.tpdo.len() {
            let slot = &self.tpdo[i];
            if !slot.enabled() {
                continue;
            }
            let sync_start = *slot.sync_start.lock().unwrap();
            if let Some(c) = counter {
                if sync_start != 0 && c < sync_start {
                    continue;
                }
            }
            let trans_type = *slot.trans_type.lock().unwrap();
            match trans_type {
                TransType::Cyclic(n) => {
                    let count = slot.sync_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if count >= n as u32 {
                        slot.sync_count.store(0, Ordering::Relaxed);
                        self.send_tpdo(i).await;
                    }
                }
                TransType::Acyclic => {
                    if slot.dirty.load(Ordering::Relaxed) {
                        self.send_tpdo(i).await;
                    }
                }
                TransType::Rtr | TransType::EventDriven => {}
            }
        }

        for i in 0..self.rpdo.len() {
            let slot = &self.rpdo[i];
            let trans_type = *slot.trans_type.lock().unwrap();
            if matches!(trans_type, TransType::EventDriven | TransType::Rtr) {
                continue;
            }
            let pending = slot.pending.lock().unwrap().take();
            if let Some(writes) = pending {
                if let Err(code) = self.od.write_many(&writes).await {
                    warn!("PDO engine on node {}: RPDO{} sync commit rejected: {code:?}", self.node_id, i + 1);
                }
            }
        }
    }

    async fn on_rpdo_frame(&self, cob_raw: u32, data: &[u8]) {
        if !self.operational() {
            return;
        }
        for (i, slot) in self.rpdo.iter().enumerate() {
            if !slot.enabled() {
                continue;
            }
            if slot.cob_id.load(Ordering::Relaxed) & 0x7FF != cob_raw & 0x7FF {
                continue;
            }
            let mapping = slot.mapping.lock().unwrap().clone();
            let writes = unpack_payload(data, &mapping);
            let trans_type = *slot.trans_type.lock().unwrap();
            if matches!(trans_type, TransType::EventDriven) {
                if let Err(code) = self.od.write_many(&writes).await {
                    warn!("PDO engine on node {}: RPDO{} commit rejected: {code:?}", self.node_id, i + 1);
                }
            } else {
                // Latest wins: a second frame before the next SYNC replaces the pending commit
                // rather than queuing behind it.
                *slot.pending.lock().unwrap() = Some(writes);
            }
        }
    }

    /// Drive the event_timer retransmit for event-driven TPDOs and feed SYNC/RPDO frames from the
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
                    self.check_event_driven().await;
                }
            }
        }
    }

    async fn handle_bus_message(&self, msg: CanMessage) {
        let raw = msg.id().raw();
        if raw == SYNC_ID.raw() {
            let counter = msg.data().first().copied();
            self.on_sync(counter).await;
        } else if msg.is_rtr() {
            self.on_rtr_frame(raw).await;
        } else {
            self.on_rpdo_frame(raw, msg.data()).await;
        }
    }

    /// Respond to an incoming RTR frame with the matching RTR-allowed TPDO, if any.
    async fn on_rtr_frame(&self, cob_raw: u32) {
        for (i, slot) in self.tpdo.iter().enumerate() {
            if !slot.enabled() || !slot.rtr_allowed() {
                continue;
            }
            if slot.cob_id.load(Ordering::Relaxed) & 0x7FF != cob_raw & 0x7FF {
                continue;
            }
            self.send_tpdo(i).await;
        }
    }

    async fn check_event_driven(&self) {
        for i in 0..self.tpdo.len() {
            let slot = &self.tpdo[i];
            if !slot.enabled() || !matches!(*slot.trans_type.lock().unwrap(), TransType::EventDriven) {
                continue;
            }
            let due_to_change = slot.dirty.load(Ordering::Relaxed);
            let due_to_timer = {
                let event_timer = *slot.event_timer.lock().unwrap();
                if event_timer.is_zero() {
                    false
                } else {
                    match *slot.last_sent.lock().unwrap() {
                        Some(last) => last.elapsed() >= event_timer,
                        None => true,
                    }
                }
            };
            if due_to_change || due_to_timer {
                self.send_tpdo(i).await;
            }
        }
    }

    /// Emit a raw SYNC frame and tick the engine as if it had been received from the bus. Used by
    /// the SYNC producer in [`crate::nmt`].
    pub async fn fire_sync(&self, sync: SyncObject) {
        let counter = sync.count;
        let msg: CanMessage = sync.into();
        if let Err(e) = self.bus.send(msg).await {
            warn!("PDO engine on node {}: failed to send SYNC: {e}", self.node_id);
        }
        self.on_sync(counter).await;
    }

    /// Re-read every TPDO/RPDO comm and mapping parameter from the OD, for use after an NMT
    /// ResetComm/ResetApp restores defaults: [`crate::od::ObjectDictionary::reset_communication`]
    /// bypasses write-callbacks, so the engine's cached config would otherwise go stale.
    pub async fn reload(&self) {
        for i in 0..object_ids::NUM_PDOS as u8 {
            self.load_tpdo_values(i).await;
            self.load_rpdo_values(i).await;
        }
    }

    /// Force an immediate send of a TPDO slot regardless of transmission type, subject to its
    /// inhibit time. Used by the local application to push an update without waiting on SYNC or
    /// the event timer (SPEC_FULL §4.4's start/update producer API).
    pub async fn update(&self, i: usize) {
        if i < self.tpdo.len() {
            self.send_tpdo(i).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackTransport;
    use canopen_eds::ElectronicDataSheet;

    const TEST_EDS: &str = include_str!("../../canopen-eds/src/example.eds");

    async fn test_setup() -> (Arc<ObjectDictionary>, Arc<CanBus<LoopbackTransport>>, Arc<PdoEngine<LoopbackTransport>>) {
        let eds = ElectronicDataSheet::from_str(TEST_EDS).unwrap();
        let od = ObjectDictionary::from_eds(&eds);
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let (_tx, rx) = watch::channel(NmtState::Operational);
        let engine = PdoEngine::start(od.clone(), bus.clone(), 5, rx).await;
        (od, bus, engine)
    }

    #[tokio::test]
    async fn tpdo_sends_cyclic_payload_on_nth_sync() {
        let (od, bus, engine) = test_setup().await;
        od.write(0x1800, 1, &0x180u32.to_le_bytes()).await.unwrap(); // clear bit 31 to enable
        od.write(0x1800, 2, &[3u8]).await.unwrap(); // cyclic every 3 SYNCs
        engine.load_tpdo_values(0).await;
        od.write(0x2001, 0, &[0x42]).await.unwrap();

        let mut rx = bus.subscribe();
        engine.on_sync(None).await;
        engine.on_sync(None).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        engine.on_sync(None).await;
        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.data()[0], 0x42);
    }

    #[tokio::test]
    async fn rpdo_latest_wins_until_sync() {
        let (od, bus, engine) = test_setup().await;
        od.write(0x1400, 1, &0x200u32.to_le_bytes()).await.unwrap(); // clear bit 31 to enable
        od.write(0x1400, 2, &[1u8]).await.unwrap(); // sync-committed
        engine.load_rpdo_values(0).await;

        let cob = CanId::Std(0x200);
        bus.send(CanMessage::new(cob, &[1])).await.unwrap();
        engine.on_rpdo_frame(cob.raw(), &[1]).await;
        bus.send(CanMessage::new(cob, &[2])).await.unwrap();
        engine.on_rpdo_frame(cob.raw(), &[2]).await;

        // Not yet committed: still the old default.
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![0]);

        engine.on_sync(None).await;
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn rpdo_event_driven_commits_immediately() {
        let (od, _bus, engine) = test_setup().await;
        // RPDO1 defaults to trans_type 0xFE (event-driven per the example device).
        od.write(0x1400, 1, &0x200u32.to_le_bytes()).await.unwrap(); // clear bit 31 to enable
        engine.load_rpdo_values(0).await;
        let cob_raw = CanId::Std(0x200).raw();
        engine.on_rpdo_frame(cob_raw, &[9]).await;
        assert_eq!(od.read(0x2001, 0).await.unwrap(), vec![9]);
    }

    #[test]
    fn pack_unpack_bit_mapping_round_trips() {
        let mapping = vec![
            MappedEntry { index: 0x2001, sub: 0, bit_len: 8 },
            MappedEntry { index: 0x2002, sub: 0, bit_len: 16 },
        ];
        let unpacked = unpack_payload(&[0xAB, 0xCD, 0xEF], &mapping);
        assert_eq!(unpacked[0], (0x2001, 0, vec![0xAB]));
        assert_eq!(unpacked[1], (0x2002, 0, vec![0xCD, 0xEF]));
    }

    #[tokio::test]
    async fn rtr_allowed_tpdo_answers_remote_frame() {
        let (od, bus, engine) = test_setup().await;
        // Bit 31 clear (enabled), bit 30 clear (RTR allowed).
        od.write(0x1800, 1, &0x180u32.to_le_bytes()).await.unwrap();
        od.write(0x1800, 2, &[253u8]).await.unwrap();
        engine.load_tpdo_values(0).await;
        od.write(0x2001, 0, &[0x7]).await.unwrap();

        let mut rx = bus.subscribe();
        let cob = CanId::Std(0x180);
        engine.on_rtr_frame(cob.raw()).await;
        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.data()[0], 0x7);
    }

    #[tokio::test]
    async fn pdo_traffic_suppressed_outside_operational() {
        let eds = ElectronicDataSheet::from_str(TEST_EDS).unwrap();
        let od = ObjectDictionary::from_eds(&eds);
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let (tx, rx) = watch::channel(NmtState::PreOperational);
        let engine = PdoEngine::start(od.clone(), bus.clone(), 5, rx).await;
        od.write(0x1800, 1, &0x180u32.to_le_bytes()).await.unwrap();
        od.write(0x1800, 2, &[1u8]).await.unwrap();
        engine.load_tpdo_values(0).await;

        let mut brx = bus.subscribe();
        engine.on_sync(None).await;
        assert!(tokio::time::timeout(Duration::from_millis(20), brx.recv()).await.is_err());

        tx.send(NmtState::Operational).unwrap();
        engine.on_sync(None).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), brx.recv()).await.is_ok());
    }
}
