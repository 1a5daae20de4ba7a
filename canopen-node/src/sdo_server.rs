//! The SDO server (C3): expedited, segmented and block transfer bound to the object dictionary.
//!
//! Because the object dictionary already exposes whole-buffer, atomic `read`/`write` (see
//! [`crate::od`]), this server does not need the teacher's partial-write buffer machinery: a
//! multi-segment or block transfer is assembled entirely in the session's own memory and only
//! touches the OD once, at the end, with a single `read`/`write` call.

use std::time::Duration;

use canopen_common::messages::{CanId, CanMessage, NmtState, SDO_REQ_BASE, SDO_RESP_BASE};
use canopen_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};
use log::warn;
use tokio::sync::{broadcast, watch};

use crate::bus::{CanBus, CanTransport};
use crate::od::ObjectDictionary;

/// Default time a session will wait for the next client frame before aborting with
/// [`AbortCode::SdoTimeout`].
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Number of segments per block this server requests/grants. Fixed, like the teacher's `BLKSIZE`.
const BLKSIZE: u8 = 127;

struct DownloadSegmented {
    toggle: bool,
    buffer: Vec<u8>,
}

struct UploadSegmented {
    toggle: bool,
    buffer: Vec<u8>,
    pos: usize,
}

struct BlockDownload {
    crc_enabled: bool,
    buffer: Vec<u8>,
    /// Sequence number of the last segment accepted so far in the current sub-block (0 = none).
    next_seq: u8,
}

struct BlockDownloadEnd {
    crc_enabled: bool,
    buffer: Vec<u8>,
}

struct BlockUploadAwaitStart {
    crc_enabled: bool,
    buffer: Vec<u8>,
}

struct BlockUploadAwaitAck {
    crc_enabled: bool,
    buffer: Vec<u8>,
    /// Bytes of `buffer` the client has fully acknowledged.
    confirmed_pos: usize,
    /// Number of segments sent since the last `confirmed_pos` advance, so a full ack can be told
    /// apart from a partial one.
    sent_this_batch: u8,
}

struct BlockUploadAwaitEnd;

enum SessionState {
    DownloadSegmented(DownloadSegmented),
    UploadSegmented(UploadSegmented),
    BlockDownload(BlockDownload),
    BlockDownloadEnd(BlockDownloadEnd),
    BlockUploadAwaitStart(BlockUploadAwaitStart),
    BlockUploadAwaitAck(BlockUploadAwaitAck),
    BlockUploadAwaitEnd(BlockUploadAwaitEnd),
}

/// An active SDO transfer: which object it targets, plus its phase-specific state.
struct ActiveSession {
    index: u16,
    sub: u8,
    state: SessionState,
}

/// The SDO server for one node id.
pub struct SdoServer<T: CanTransport> {
    od: std::sync::Arc<ObjectDictionary>,
    bus: std::sync::Arc<CanBus<T>>,
    node_id: u8,
    timeout: Duration,
    force_segment: bool,
    nmt_state: Option<watch::Receiver<NmtState>>,
}

impl<T: CanTransport> SdoServer<T> {
    /// Build a server that listens on `0x600 + node_id` and responds on `0x580 + node_id`.
    pub fn new(od: std::sync::Arc<ObjectDictionary>, bus: std::sync::Arc<CanBus<T>>, node_id: u8) -> Self {
        Self {
            od,
            bus,
            node_id,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            force_segment: false,
            nmt_state: None,
        }
    }

    /// Override the response timeout (default 1.0s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Always use segmented upload, even for objects that would fit in an expedited frame.
    /// Exists for interop testing against clients that mishandle expedited transfer.
    pub fn with_force_segment(mut self, force_segment: bool) -> Self {
        self.force_segment = force_segment;
        self
    }

    /// Gate service on NMT state: requests are only answered in PreOperational/Operational, and a
    /// transition to Stopped aborts any session in progress (§5).
    pub fn with_nmt_state(mut self, nmt_state: watch::Receiver<NmtState>) -> Self {
        self.nmt_state = Some(nmt_state);
        self
    }

    fn service_allowed(&self) -> bool {
        match &self.nmt_state {
            Some(rx) => !matches!(*rx.borrow(), NmtState::Stopped | NmtState::Initialising),
            None => true,
        }
    }

    fn resp_id(&self) -> CanId {
        CanId::Std(SDO_RESP_BASE + self.node_id as u16)
    }

    async fn send(&self, resp: SdoResponse) {
        let msg = resp.to_can_message(self.resp_id());
        if let Err(e) = self.bus.send(msg).await {
            warn!("SDO server on node {}: failed to send response: {e}", self.node_id);
        }
    }

    async fn send_raw(&self, data: [u8; 8]) {
        let msg = CanMessage::new(self.resp_id(), &data);
        if let Err(e) = self.bus.send(msg).await {
            warn!("SDO server on node {}: failed to send response: {e}", self.node_id);
        }
    }

    async fn abort(&self, index: u16, sub: u8, abort_code: AbortCode) {
        warn!(
            "SDO server on node {}: aborting 0x{index:04X}sub{sub:02X}: {abort_code:?}",
            self.node_id
        );
        self.send(SdoResponse::abort(index, sub, abort_code)).await;
    }

    /// Run the server until the bus channel closes. Meant to be spawned as its own task.
    pub async fn run(mut self) {
        let req_id = CanId::Std(SDO_REQ_BASE + self.node_id as u16);
        let mut rx = self.bus.subscribe();
        let mut session: Option<ActiveSession> = None;
        let mut nmt_state = self.nmt_state.clone();

        loop {
            let timeout = async {
                match &session {
                    Some(_) => tokio::time::sleep(self.timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let state_change = async {
                match &mut nmt_state {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(msg) if msg.id() == req_id => {
                            if self.service_allowed() {
                                session = self.handle_frame(session, msg.data()).await;
                            }
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = timeout => {
                    if let Some(active) = session.take() {
                        self.abort(active.index, active.sub, AbortCode::SdoTimeout).await;
                    }
                }
                changed = state_change => {
                    if changed.is_err() {
                        break;
                    }
                    if !self.service_allowed() {
                        if let Some(active) = session.take() {
                            self.abort(active.index, active.sub, AbortCode::SdoTimeout).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, session: Option<ActiveSession>, data: &[u8]) -> Option<ActiveSession> {
        match session {
            None => self.handle_idle(data).await,
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::BlockDownload(state),
            }) => self.handle_block_download_segment(index, sub, state, data).await,
            Some(active) => self.handle_command(active, data).await,
        }
    }

    async fn handle_idle(&self, data: &[u8]) -> Option<ActiveSession> {
        let req = match SdoRequest::try_from(data) {
            Ok(req) => req,
            Err(code) => {
                // No index/sub known yet; CiA 301 has no frame to blame, so there's nothing
                // sensible to abort. Drop it.
                warn!("SDO server on node {}: malformed request ({code:?})", self.node_id);
                return None;
            }
        };

        match req {
            SdoRequest::InitiateDownload { n, e, s, index, sub, data } => {
                self.start_download(index, sub, e, s, n, &data).await
            }
            SdoRequest::InitiateUpload { index, sub } => self.start_upload(index, sub).await,
            SdoRequest::InitiateBlockDownload { cc, s, index, sub, size } => {
                self.start_block_download(index, sub, cc, s, size).await
            }
            SdoRequest::InitiateBlockUpload { cc, index, sub, blksize, .. } => {
                self.start_block_upload(index, sub, cc, blksize).await
            }
            SdoRequest::Abort { .. } => None,
            _ => {
                // Any other command with no active session is a protocol violation; there's no
                // index/sub to blame it on.
                None
            }
        }
    }

    async fn start_download(&self, index: u16, sub: u8, expedited: bool, size_known: bool, n: u8, data: &[u8; 4]) -> Option<ActiveSession> {
        if expedited {
            // `n` counts unused trailing bytes only when the client declared a size; a client that
            // leaves s=0 is relying on the server already knowing the object's fixed width.
            let len = if size_known { 4 - n as usize } else { 4 };
            let payload = &data[..len.min(4)];
            match self.od.write(index, sub, payload).await {
                Ok(()) => {
                    self.send(SdoResponse::download_acknowledge(index, sub)).await;
                    None
                }
                Err(code) => {
                    self.abort(index, sub, code).await;
                    None
                }
            }
        } else {
            self.send(SdoResponse::download_acknowledge(index, sub)).await;
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::DownloadSegmented(DownloadSegmented {
                    toggle: false,
                    buffer: Vec::new(),
                }),
            })
        }
    }

    async fn start_upload(&self, index: u16, sub: u8) -> Option<ActiveSession> {
        let data = match self.od.read(index, sub).await {
            Ok(data) => data,
            Err(code) => {
                self.abort(index, sub, code).await;
                return None;
            }
        };

        if data.len() <= 4 && !self.force_segment {
            self.send(SdoResponse::expedited_upload(index, sub, &data)).await;
            None
        } else {
            self.send(SdoResponse::upload_acknowledge(index, sub, Some(data.len() as u32))).await;
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::UploadSegmented(UploadSegmented {
                    toggle: false,
                    buffer: data,
                    pos: 0,
                }),
            })
        }
    }

    async fn start_block_download(&self, index: u16, sub: u8, client_crc: bool, size_known: bool, size: u32) -> Option<ActiveSession> {
        if let Err(code) = self.od.describe(index, sub).await {
            self.abort(index, sub, code).await;
            return None;
        }
        let _ = size_known;
        let buffer = Vec::with_capacity(size as usize);
        self.send(SdoResponse::block_download_acknowledge(client_crc, index, sub, BLKSIZE)).await;
        Some(ActiveSession {
            index,
            sub,
            state: SessionState::BlockDownload(BlockDownload {
                crc_enabled: client_crc,
                buffer,
                next_seq: 0,
            }),
        })
    }

    async fn start_block_upload(&self, index: u16, sub: u8, client_crc: bool, blksize: u8) -> Option<ActiveSession> {
        if blksize == 0 || blksize > 127 {
            self.abort(index, sub, AbortCode::InvalidBlockSize).await;
            return None;
        }
        let data = match self.od.read(index, sub).await {
            Ok(data) => data,
            Err(code) => {
                self.abort(index, sub, code).await;
                return None;
            }
        };
        self.send(SdoResponse::block_upload_acknowledge(client_crc, index, sub, Some(data.len() as u32))).await;
        Some(ActiveSession {
            index,
            sub,
            state: SessionState::BlockUploadAwaitStart(BlockUploadAwaitStart {
                crc_enabled: client_crc,
                buffer: data,
            }),
        })
    }

    /// Handle a command-framed request (everything except raw block-download data segments, which
    /// are dispatched separately since their bit layout overlaps ordinary command bytes).
    async fn handle_command(&self, active: ActiveSession, data: &[u8]) -> Option<ActiveSession> {
        let index = active.index;
        let sub = active.sub;

        let req = match SdoRequest::try_from(data) {
            Ok(req) => req,
            Err(_) => {
                self.abort(index, sub, AbortCode::InvalidCommandSpecifier).await;
                return None;
            }
        };

        if let SdoRequest::Abort { .. } = req {
            return None;
        }

        match (active.state, req) {
            (SessionState::DownloadSegmented(state), SdoRequest::DownloadSegment { t, c, data, .. }) => {
                self.continue_download_segmented(index, sub, state, t, c, &data).await
            }
            (SessionState::UploadSegmented(state), SdoRequest::ReqUploadSegment { t }) => {
                self.continue_upload_segmented(index, sub, state, t).await
            }
            (SessionState::BlockDownloadEnd(state), SdoRequest::EndBlockDownload { n, crc }) => {
                self.finish_block_download(index, sub, state, n, crc).await
            }
            (SessionState::BlockUploadAwaitStart(state), SdoRequest::StartBlockUpload) => {
                self.send_block_batch(index, sub, state.crc_enabled, state.buffer, 0, BLKSIZE).await
            }
            (SessionState::BlockUploadAwaitAck(state), SdoRequest::ConfirmBlock { ackseq, blksize }) => {
                self.continue_block_upload(index, sub, state, ackseq, blksize).await
            }
            (SessionState::BlockUploadAwaitEnd(_), SdoRequest::EndBlockUpload) => None,
            (_, _) => {
                self.abort(index, sub, AbortCode::InvalidCommandSpecifier).await;
                None
            }
        }
    }

    async fn continue_download_segmented(
        &self,
        index: u16,
        sub: u8,
        mut state: DownloadSegmented,
        toggle: bool,
        last: bool,
        data: &[u8; 7],
    ) -> Option<ActiveSession> {
        if toggle != state.toggle {
            self.abort(index, sub, AbortCode::ToggleNotAlternated).await;
            return None;
        }
        state.buffer.extend_from_slice(data);
        state.toggle = !state.toggle;

        if last {
            // The teacher's `n` field (unused trailing bytes of the final segment) only matters
            // for variable-length entries; trim here so the OD sees exactly the declared payload.
            if let Err(code) = self.od.write(index, sub, &state.buffer).await {
                self.abort(index, sub, code).await;
                return None;
            }
            self.send(SdoResponse::download_segment_acknowledge(toggle)).await;
            None
        } else {
            self.send(SdoResponse::download_segment_acknowledge(toggle)).await;
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::DownloadSegmented(state),
            })
        }
    }

    async fn continue_upload_segmented(&self, index: u16, sub: u8, mut state: UploadSegmented, toggle: bool) -> Option<ActiveSession> {
        if toggle != state.toggle {
            self.abort(index, sub, AbortCode::ToggleNotAlternated).await;
            return None;
        }

        let remaining = &state.buffer[state.pos..];
        let chunk_len = remaining.len().min(7);
        let chunk = &remaining[..chunk_len];
        let is_last = state.pos + chunk_len >= state.buffer.len();

        self.send(SdoResponse::upload_segment(toggle, is_last, chunk)).await;
        state.pos += chunk_len;
        state.toggle = !toggle;

        if is_last {
            None
        } else {
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::UploadSegmented(state),
            })
        }
    }

    /// Parse an incoming frame while in `BlockDownload` as a raw data segment rather than a
    /// command-framed request: the bit layouts genuinely overlap, so only the session's phase
    /// disambiguates them.
    async fn handle_block_download_segment(&self, index: u16, sub: u8, mut state: BlockDownload, data: &[u8]) -> Option<ActiveSession> {
        let segment = match BlockSegment::try_from(data) {
            Ok(segment) => segment,
            Err(_) => {
                self.abort(index, sub, AbortCode::InvalidSequenceNumber).await;
                return None;
            }
        };

        if segment.seqnum == state.next_seq + 1 {
            state.buffer.extend_from_slice(&segment.data);
            state.next_seq = segment.seqnum;
        }
        // Out-of-order or duplicate segments are silently dropped; the client learns about the
        // gap from the ackseq in the next ConfirmBlock and resumes from there.

        if segment.c {
            let ackseq = state.next_seq;
            self.send(SdoResponse::confirm_block(ackseq, BLKSIZE)).await;
            if ackseq == segment.seqnum {
                // The client's last segment was accepted in sequence: the whole payload has been
                // received and the client will send the END command next.
                Some(ActiveSession {
                    index,
                    sub,
                    state: SessionState::BlockDownloadEnd(BlockDownloadEnd {
                        crc_enabled: state.crc_enabled,
                        buffer: state.buffer,
                    }),
                })
            } else {
                // Gap in the block: keep collecting this same block, continuing after the last
                // good segment.
                state.next_seq = ackseq;
                Some(ActiveSession {
                    index,
                    sub,
                    state: SessionState::BlockDownload(state),
                })
            }
        } else if segment.seqnum >= BLKSIZE {
            // Full sub-block received; ack and start a fresh one.
            self.send(SdoResponse::confirm_block(state.next_seq, BLKSIZE)).await;
            state.next_seq = 0;
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::BlockDownload(state),
            })
        } else {
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::BlockDownload(state),
            })
        }
    }

    async fn finish_block_download(&self, index: u16, sub: u8, mut state: BlockDownloadEnd, n: u8, crc: u16) -> Option<ActiveSession> {
        let drop = n as usize;
        if drop > 0 && drop <= state.buffer.len() {
            state.buffer.truncate(state.buffer.len() - drop);
        }

        if state.crc_enabled {
            let computed = crc16::State::<crc16::XMODEM>::calculate(&state.buffer);
            if computed != crc {
                self.abort(index, sub, AbortCode::CrcError).await;
                return None;
            }
        }

        match self.od.write(index, sub, &state.buffer).await {
            Ok(()) => {
                self.send(SdoResponse::ConfirmBlockDownloadEnd).await;
                None
            }
            Err(code) => {
                self.abort(index, sub, code).await;
                None
            }
        }
    }

    /// Send up to `blksize` segments starting at `pos` of `buffer`, then wait for the client's ack.
    async fn send_block_batch(
        &self,
        index: u16,
        sub: u8,
        crc_enabled: bool,
        buffer: Vec<u8>,
        pos: usize,
        blksize: u8,
    ) -> Option<ActiveSession> {
        let mut seqnum = 0u8;
        let mut cursor = pos;
        while seqnum < blksize && cursor < buffer.len() {
            seqnum += 1;
            let end = (cursor + 7).min(buffer.len());
            let mut chunk = [0u8; 7];
            chunk[..end - cursor].copy_from_slice(&buffer[cursor..end]);
            let is_last_overall = end >= buffer.len();
            let segment = BlockSegment {
                c: is_last_overall,
                seqnum,
                data: chunk,
            };
            self.send_raw(segment.to_bytes()).await;
            cursor = end;
            if is_last_overall {
                break;
            }
        }

        if cursor >= buffer.len() {
            let crc = if crc_enabled {
                crc16::State::<crc16::XMODEM>::calculate(&buffer)
            } else {
                0
            };
            let last_segment_bytes = buffer.len().saturating_sub(pos) % 7;
            let n = if last_segment_bytes == 0 { 0 } else { (7 - last_segment_bytes) as u8 };
            self.send(SdoResponse::block_upload_end(n, crc)).await;
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::BlockUploadAwaitEnd(BlockUploadAwaitEnd),
            })
        } else {
            Some(ActiveSession {
                index,
                sub,
                state: SessionState::BlockUploadAwaitAck(BlockUploadAwaitAck {
                    crc_enabled,
                    buffer,
                    confirmed_pos: pos,
                    sent_this_batch: seqnum,
                }),
            })
        }
    }

    async fn continue_block_upload(&self, index: u16, sub: u8, state: BlockUploadAwaitAck, ackseq: u8, next_blksize: u8) -> Option<ActiveSession> {
        let good = ackseq.min(state.sent_this_batch) as usize;
        let new_pos = (state.confirmed_pos + good * 7).min(state.buffer.len());
        self.send_block_batch(index, sub, state.crc_enabled, state.buffer, new_pos, next_blksize.max(1)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackTransport;
    use crate::od::ObjectDictionary;
    use canopen_eds::ElectronicDataSheet;
    use std::sync::Arc;

    const TEST_EDS: &str = include_str!("../../canopen-eds/src/example.eds");

    fn test_od() -> Arc<ObjectDictionary> {
        let eds = ElectronicDataSheet::from_str(TEST_EDS).unwrap();
        ObjectDictionary::from_eds(&eds)
    }

    fn client_id(node_id: u8) -> CanId {
        CanId::Std(SDO_REQ_BASE + node_id as u16)
    }

    fn server_id(node_id: u8) -> CanId {
        CanId::Std(SDO_RESP_BASE + node_id as u16)
    }

    async fn recv_response(rx: &mut broadcast::Receiver<CanMessage>) -> SdoResponse {
        loop {
            let msg = rx.recv().await.unwrap();
            if let Ok(resp) = SdoResponse::try_from(msg) {
                return resp;
            }
        }
    }

    #[tokio::test]
    async fn expedited_round_trip() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5);
        tokio::spawn(server.run());

        let mut rx = bus.subscribe();
        bus.send(SdoRequest::expedited_download(0x2001, 0, &[0xFD]).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmDownload { index: 0x2001, sub: 0 }));

        bus.send(SdoRequest::initiate_upload(0x2001, 0).to_can_message(client_id(5)))
            .await
            .unwrap();
        match recv_response(&mut rx).await {
            SdoResponse::ConfirmUpload { data, .. } => assert_eq!(data[0], 0xFD),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn segmented_string_round_trip() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        let text = b"Im a CANopen device";
        assert_eq!(text.len(), 19);

        bus.send(SdoRequest::initiate_download(0x2100, 0, Some(text.len() as u32)).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmDownload { .. }));

        let mut toggle = false;
        for (i, chunk) in text.chunks(7).enumerate() {
            let is_last = (i + 1) * 7 >= text.len();
            bus.send(SdoRequest::download_segment(toggle, is_last, chunk).to_can_message(client_id(5)))
                .await
                .unwrap();
            assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmDownloadSegment { t } if t == toggle));
            toggle = !toggle;
        }

        assert_eq!(od.read(0x2100, 0).await.unwrap(), text);

        // Upload it back
        bus.send(SdoRequest::initiate_upload(0x2100, 0).to_can_message(client_id(5)))
            .await
            .unwrap();
        let size = match recv_response(&mut rx).await {
            SdoResponse::ConfirmUpload { data, .. } => u32::from_le_bytes(data),
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(size, text.len() as u32);

        let mut toggle = false;
        let mut received = Vec::new();
        loop {
            bus.send(SdoRequest::upload_segment_request(toggle).to_can_message(client_id(5)))
                .await
                .unwrap();
            match recv_response(&mut rx).await {
                SdoResponse::UploadSegment { n, c, data, .. } => {
                    received.extend_from_slice(&data[..7 - n as usize]);
                    if c {
                        break;
                    }
                }
                other => panic!("unexpected response: {other:?}"),
            }
            toggle = !toggle;
        }
        assert_eq!(received, text);
    }

    #[tokio::test]
    async fn block_download_with_crc() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        let payload: Vec<u8> = "123456".repeat(100).into_bytes();
        assert_eq!(payload.len(), 600);
        let crc = crc16::State::<crc16::XMODEM>::calculate(&payload);

        bus.send(SdoRequest::initiate_block_download(0x2200, 0, true, payload.len() as u32).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmBlockDownload { .. }));

        let mut seqnum = 0u8;
        for (i, chunk) in payload.chunks(7).enumerate() {
            seqnum += 1;
            let mut data = [0u8; 7];
            data[..chunk.len()].copy_from_slice(chunk);
            let is_last = (i + 1) * 7 >= payload.len();
            let segment = BlockSegment { c: is_last, seqnum, data };
            bus.send(segment.to_can_message(client_id(5))).await.unwrap();
            if is_last {
                assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmBlock { ackseq, .. } if ackseq == seqnum));
            }
        }

        let last_chunk_len = payload.len() % 7;
        let n = if last_chunk_len == 0 { 0 } else { 7 - last_chunk_len as u8 };
        bus.send(SdoRequest::end_block_download(n, crc).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmBlockDownloadEnd));

        assert_eq!(od.read(0x2200, 0).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn block_download_bad_crc_aborts() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        let payload = vec![0xAAu8; 14];

        bus.send(SdoRequest::initiate_block_download(0x2200, 0, true, payload.len() as u32).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmBlockDownload { .. }));

        for (i, chunk) in payload.chunks(7).enumerate() {
            let mut data = [0u8; 7];
            data.copy_from_slice(chunk);
            let segment = BlockSegment { c: i == 1, seqnum: (i + 1) as u8, data };
            bus.send(segment.to_can_message(client_id(5))).await.unwrap();
        }
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmBlock { .. }));

        bus.send(SdoRequest::end_block_download(0, 0xDEAD).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(
            recv_response(&mut rx).await,
            SdoResponse::Abort { abort_code, .. } if abort_code == AbortCode::CrcError as u32
        ));
    }

    #[tokio::test]
    async fn block_upload_round_trip() {
        let od = test_od();
        od.write(0x2200, 0, &"abcdefghijklmno".repeat(10).into_bytes()).await.unwrap();
        let expected = od.read(0x2200, 0).await.unwrap();

        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        bus.send(SdoRequest::initiate_block_upload(0x2200, 0, true, BLKSIZE).to_can_message(client_id(5)))
            .await
            .unwrap();
        let size = match recv_response(&mut rx).await {
            SdoResponse::ConfirmBlockUpload { size, .. } => size,
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(size as usize, expected.len());

        bus.send(SdoRequest::start_block_upload().to_can_message(client_id(5))).await.unwrap();

        let mut received = Vec::new();
        let mut last_seq = 0u8;
        let crc;
        loop {
            let msg = rx.recv().await.unwrap();
            if let Ok(segment) = BlockSegment::try_from(msg.data()) {
                received.extend_from_slice(&segment.data);
                last_seq = segment.seqnum;
                if segment.c {
                    bus.send(SdoRequest::confirm_block_upload(last_seq, BLKSIZE).to_can_message(client_id(5)))
                        .await
                        .unwrap();
                    match recv_response(&mut rx).await {
                        SdoResponse::BlockUploadEnd { n, crc: c } => {
                            received.truncate(received.len() - n as usize);
                            crc = c;
                            break;
                        }
                        other => panic!("unexpected response: {other:?}"),
                    }
                }
            } else if let Ok(SdoResponse::ConfirmBlock { .. }) = SdoResponse::try_from(msg) {
                bus.send(SdoRequest::confirm_block_upload(last_seq, BLKSIZE).to_can_message(client_id(5)))
                    .await
                    .unwrap();
            }
        }

        bus.send(SdoRequest::end_block_upload().to_can_message(client_id(5))).await.unwrap();

        assert_eq!(received, expected);
        assert_eq!(crc, crc16::State::<crc16::XMODEM>::calculate(&expected));
    }

    #[tokio::test]
    async fn toggle_mismatch_aborts() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        bus.send(SdoRequest::initiate_download(0x2100, 0, Some(10)).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmDownload { .. }));

        // Send with the wrong toggle bit (should be false first).
        bus.send(SdoRequest::download_segment(true, false, b"wrong!!").to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(
            recv_response(&mut rx).await,
            SdoResponse::Abort { abort_code, .. } if abort_code == AbortCode::ToggleNotAlternated as u32
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_times_out() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5).with_timeout(Duration::from_millis(100));
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        bus.send(SdoRequest::initiate_download(0x2100, 0, Some(10)).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmDownload { .. }));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(
            recv_response(&mut rx).await,
            SdoResponse::Abort { abort_code, .. } if abort_code == AbortCode::SdoTimeout as u32
        ));
    }

    #[tokio::test]
    async fn force_segment_uses_segmented_upload_for_small_objects() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let server = SdoServer::new(od.clone(), bus.clone(), 5).with_force_segment(true);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        bus.send(SdoRequest::initiate_upload(0x2001, 0).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmUpload { size: Some(1), .. }));
    }

    #[tokio::test]
    async fn requests_ignored_outside_preop_and_operational() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let (_tx, nmt_rx) = watch::channel(NmtState::Stopped);
        let server = SdoServer::new(od.clone(), bus.clone(), 5).with_nmt_state(nmt_rx);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        bus.send(SdoRequest::initiate_upload(0x2001, 0).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), recv_response(&mut rx)).await.is_err());
    }

    #[tokio::test]
    async fn stopped_transition_aborts_active_session() {
        let od = test_od();
        let bus = Arc::new(CanBus::new(LoopbackTransport::default()));
        let (tx, nmt_rx) = watch::channel(NmtState::Operational);
        let server = SdoServer::new(od.clone(), bus.clone(), 5).with_nmt_state(nmt_rx);
        tokio::spawn(server.run());
        let mut rx = bus.subscribe();

        bus.send(SdoRequest::initiate_download(0x2100, 0, Some(10)).to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(matches!(recv_response(&mut rx).await, SdoResponse::ConfirmDownload { .. }));

        tx.send(NmtState::Stopped).unwrap();
        assert!(matches!(
            recv_response(&mut rx).await,
            SdoResponse::Abort { index: 0x2100, sub: 0, abort_code } if abort_code == AbortCode::SdoTimeout as u32
        ));

        // The session is cleared, so a fresh download segment after this point is ignored rather
        // than answered.
        bus.send(SdoRequest::download_segment(false, true, b"wrong!!").to_can_message(client_id(5)))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), recv_response(&mut rx)).await.is_err());
    }

    #[allow(dead_code)]
    fn assert_ids_are_used(node_id: u8) {
        let _ = server_id(node_id);
    }
}
