use bytes::{Bytes, BytesMut};
use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time::Instant,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{NexusError, Result},
    handshake::Completions,
    protocol::{encode_ack, encode_missing_list, Packet},
    radio::Radio,
    sync::Worker,
    types::{DeviceId, TransferConfig},
};

/// Result of feeding one notification to the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Packet failed the acceptance rule or was out of range
    Dropped,
    /// Packet was stored; the wave still has holes
    Stored,
    /// Wave completed and more packets follow
    WaveComplete {
        /// Acknowledgment to write
        ack: Bytes,
    },
    /// Last wave completed
    Finished {
        /// Acknowledgment to write
        ack: Bytes,
        /// The reassembled document
        document: String,
    },
}

/// Result of a stall review
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Packets are still flowing, or the wave is full
    Idle,
    /// The wave stalled; the missing list must be written
    Stalled {
        /// Missing-packet bitmap frame
        missing_list: Bytes,
    },
}

/// Reassembly state of one document transfer
///
/// The buffer keeps one slot per sequence number of the current wave. Its
/// size is fixed for the wave and only shrinks when the next wave starts.
#[derive(Debug)]
pub struct TransferState {
    config: TransferConfig,
    buffer: Vec<Option<Bytes>>,
    awaiting_missed_packets: bool,
    total_remaining: u32,
    document: BytesMut,
    last_notify: Instant,
    wave: u32,
    rounds: u32,
    reviewer_armed: bool,
}

impl TransferState {
    /// Start a transfer of `total_packets` packets
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Protocol`] when there is nothing to transfer.
    pub fn new(total_packets: u32, config: TransferConfig, now: Instant) -> Result<Self> {
        if total_packets == 0 {
            return Err(NexusError::Protocol("nothing to transfer".to_string()));
        }

        let mut state = Self {
            config,
            buffer: Vec::new(),
            awaiting_missed_packets: false,
            total_remaining: total_packets,
            document: BytesMut::new(),
            last_notify: now,
            wave: 0,
            rounds: 0,
            reviewer_armed: false,
        };
        state.start_wave();
        Ok(state)
    }

    fn start_wave(&mut self) {
        let size = usize::try_from(self.total_remaining)
            .unwrap_or(usize::MAX)
            .min(self.config.max_wave_size);
        self.buffer = vec![None; size];
        self.awaiting_missed_packets = false;
        self.rounds = 0;
    }

    /// Index of the current wave, starting at 0
    #[must_use]
    pub const fn wave(&self) -> u32 {
        self.wave
    }

    /// Number of packets in the current wave
    #[must_use]
    pub fn wave_size(&self) -> usize {
        self.buffer.len()
    }

    /// Packets not yet covered by a completed wave
    #[must_use]
    pub const fn total_remaining(&self) -> u32 {
        self.total_remaining
    }

    /// Check if retransmitted packets are expected
    #[must_use]
    pub const fn is_awaiting_missed_packets(&self) -> bool {
        self.awaiting_missed_packets
    }

    /// Sequence numbers of the current wave not yet received
    #[must_use]
    pub fn missing_sequences(&self) -> Vec<usize> {
        self.buffer
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(sequence, _)| sequence)
            .collect()
    }

    /// Mark the stall reviewer as running
    ///
    /// Returns `true` if it was not running and must be started.
    pub fn arm_reviewer(&mut self) -> bool {
        !std::mem::replace(&mut self.reviewer_armed, true)
    }

    /// Feed one raw notification value
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::MalformedDocument`] if the finished document is
    /// not valid UTF-8.
    pub fn accept(&mut self, raw: &[u8], now: Instant) -> Result<AcceptOutcome> {
        let packet = match Packet::from_bytes(raw) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(error = %err, "dropping undecodable notification");
                return Ok(AcceptOutcome::Dropped);
            }
        };

        if packet.missing_flag != self.awaiting_missed_packets {
            trace!(
                sequence = packet.sequence,
                missing_flag = packet.missing_flag,
                "dropping out-of-phase packet"
            );
            return Ok(AcceptOutcome::Dropped);
        }

        let Some(slot) = self.buffer.get_mut(usize::from(packet.sequence)) else {
            debug!(
                sequence = packet.sequence,
                wave_size = self.buffer.len(),
                "dropping packet outside the wave"
            );
            return Ok(AcceptOutcome::Dropped);
        };
        *slot = Some(packet.fragment);
        self.last_notify = now;

        if self.buffer.iter().any(Option::is_none) {
            return Ok(AcceptOutcome::Stored);
        }

        for fragment in self.buffer.iter().flatten() {
            self.document.extend_from_slice(fragment);
        }
        let completed = u32::try_from(self.buffer.len()).unwrap_or(u32::MAX);
        self.total_remaining = self.total_remaining.saturating_sub(completed);
        let ack = encode_ack(self.config.frame_len);
        debug!(
            wave = self.wave,
            packets = completed,
            remaining = self.total_remaining,
            "wave complete"
        );

        if self.total_remaining > 0 {
            self.wave += 1;
            self.start_wave();
            return Ok(AcceptOutcome::WaveComplete { ack });
        }

        self.buffer.clear();
        let bytes = std::mem::take(&mut self.document).freeze();
        let document = String::from_utf8(bytes.to_vec())
            .map_err(|err| NexusError::MalformedDocument(err.to_string()))?;
        Ok(AcceptOutcome::Finished { ack, document })
    }

    /// Restart the silence window once a wave acknowledgment is confirmed
    ///
    /// The next wave is only measured from the moment the robot could have
    /// started sending it.
    pub fn acknowledged(&mut self, now: Instant) {
        self.last_notify = now;
    }

    /// Decide whether the current wave has stalled
    ///
    /// A stall marks the transfer as awaiting retransmissions and restarts the
    /// silence window, so a wave that stays silent stalls again one threshold
    /// later.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::RetransmissionLimit`] once the wave has used up
    /// its retransmission rounds.
    pub fn review(&mut self, now: Instant) -> Result<ReviewOutcome> {
        let holes: Vec<bool> = self.buffer.iter().map(Option::is_none).collect();
        if !holes.contains(&true)
            || now.saturating_duration_since(self.last_notify) < self.config.stall_threshold()
        {
            return Ok(ReviewOutcome::Idle);
        }

        if self.rounds >= self.config.max_retransmission_rounds {
            return Err(NexusError::RetransmissionLimit {
                wave: self.wave,
                rounds: self.rounds,
            });
        }

        self.rounds += 1;
        self.awaiting_missed_packets = true;
        self.last_notify = now;
        Ok(ReviewOutcome::Stalled {
            missing_list: encode_missing_list(&holes, self.config.frame_len),
        })
    }
}

struct Shared {
    radio: Arc<dyn Radio>,
    device: DeviceId,
    sink: Uuid,
    state: Mutex<TransferState>,
    completions: Arc<Completions>,
    review_interval: Duration,
    write_timeout: Duration,
    reviewer: Arc<StdMutex<Option<Worker>>>,
    done: StdMutex<Option<oneshot::Sender<Result<String>>>>,
}

impl Shared {
    async fn write_frame(&self, frame: Bytes, what: &'static str) -> Result<()> {
        if !self
            .radio
            .write_characteristic(&self.device, self.sink, frame)
            .await
        {
            return Err(NexusError::Protocol(format!("{what} write refused")));
        }

        let (uuid, status) = self.completions.write.take(Some(self.write_timeout)).await?;
        if uuid != self.sink {
            warn!(device = %self.device, %uuid, "write confirmation for another characteristic");
        }
        if !status.is_success() {
            return Err(NexusError::Protocol(format!(
                "{what} write failed with status {status}"
            )));
        }
        Ok(())
    }

    fn finish(&self, result: Result<String>) {
        let sender = lock(&self.done).take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
        if let Some(reviewer) = lock(&self.reviewer).take() {
            reviewer.close();
        }
    }

    fn spawn_reviewer(self: &Arc<Self>) {
        let shared = self.clone();
        let worker = Worker::spawn("transfer-review", move |keep_alive| async move {
            while keep_alive.is_alive() {
                tokio::time::sleep(shared.review_interval).await;

                let mut state = shared.state.lock().await;
                match state.review(Instant::now()) {
                    Ok(ReviewOutcome::Idle) => {}
                    Ok(ReviewOutcome::Stalled { missing_list }) => {
                        info!(
                            device = %shared.device,
                            wave = state.wave(),
                            missing = ?state.missing_sequences(),
                            "wave stalled, requesting retransmission"
                        );
                        if let Err(err) = shared.write_frame(missing_list, "missing list").await {
                            drop(state);
                            shared.finish(Err(err));
                            break;
                        }
                    }
                    Err(err) => {
                        drop(state);
                        shared.finish(Err(err));
                        break;
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.reviewer).replace(worker) {
            previous.close();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Parameters of a transfer session
#[derive(Debug, Clone)]
pub struct TransferParams {
    /// Connected robot
    pub device: DeviceId,
    /// Characteristic receiving missing lists and acknowledgments
    pub sink: Uuid,
    /// Packets the robot announced
    pub total_packets: u32,
    /// Protocol tuning
    pub config: TransferConfig,
    /// Bound on each write confirmation
    pub write_timeout: Duration,
}

/// Running document transfer
///
/// Owns the notification drainer and the stall reviewer. Closing the session,
/// or dropping it, stops both and discards any partial document.
#[derive(Debug)]
pub struct TransferSession {
    drainer: Worker,
    reviewer: Arc<StdMutex<Option<Worker>>>,
}

impl TransferSession {
    /// Start draining `notifications` into a new transfer
    ///
    /// The returned receiver resolves with the document once the last wave is
    /// acknowledged, or with the error that aborted the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Protocol`] when the robot announced no packets.
    pub fn start(
        radio: Arc<dyn Radio>,
        completions: Arc<Completions>,
        params: TransferParams,
        mut notifications: mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<(Self, oneshot::Receiver<Result<String>>)> {
        let state = TransferState::new(params.total_packets, params.config.clone(), Instant::now())?;
        let (done_tx, done_rx) = oneshot::channel();
        let reviewer = Arc::new(StdMutex::new(None));

        info!(
            device = %params.device,
            total_packets = params.total_packets,
            wave_size = state.wave_size(),
            "starting transfer"
        );

        let shared = Arc::new(Shared {
            radio,
            device: params.device,
            sink: params.sink,
            state: Mutex::new(state),
            completions,
            review_interval: params.config.review_interval(),
            write_timeout: params.write_timeout,
            reviewer: reviewer.clone(),
            done: StdMutex::new(Some(done_tx)),
        });

        let drainer = Worker::spawn("notification-drain", move |keep_alive| async move {
            while let Some(value) = notifications.recv().await {
                if !keep_alive.is_alive() {
                    break;
                }

                let mut state = shared.state.lock().await;
                let outcome = match state.accept(&value, Instant::now()) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        drop(state);
                        shared.finish(Err(err));
                        break;
                    }
                };

                match outcome {
                    AcceptOutcome::Dropped | AcceptOutcome::Stored => {}
                    AcceptOutcome::WaveComplete { ack } => {
                        if let Err(err) = shared.write_frame(ack, "wave acknowledgment").await {
                            drop(state);
                            shared.finish(Err(err));
                            break;
                        }
                        state.acknowledged(Instant::now());
                    }
                    AcceptOutcome::Finished { ack, document } => {
                        let result = shared
                            .write_frame(ack, "final acknowledgment")
                            .await
                            .map(|()| document);
                        drop(state);
                        shared.finish(result);
                        break;
                    }
                }

                if state.arm_reviewer() {
                    shared.spawn_reviewer();
                }
            }
        });

        Ok((Self { drainer, reviewer }, done_rx))
    }

    /// Check if the transfer is still draining notifications
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.drainer.is_active()
    }

    /// Stop both workers
    pub fn close(&self) {
        self.drainer.close();
        if let Some(reviewer) = lock(&self.reviewer).take() {
            reviewer.close();
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{decode_missing_list, CharacteristicRole},
        radio::{
            mock::{MockRadio, MockScript, RadioCall},
            RadioEvent,
        },
    };

    fn config() -> TransferConfig {
        TransferConfig::default()
    }

    fn packet(missing_flag: bool, sequence: u8, fragment: &str) -> Bytes {
        Packet::new(missing_flag, sequence, fragment.as_bytes().to_vec()).to_bytes()
    }

    fn fragments(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("<{i:03}>")).collect()
    }

    #[test]
    fn test_zero_packets_rejected() {
        assert!(TransferState::new(0, config(), Instant::now()).is_err());
    }

    #[test]
    fn test_reassembly_is_order_independent() {
        let parts = ["{\"msgtype\":", "\"ack\",", "\"name\":", "\"r1\"}"];
        let expected: String = parts.concat();
        let orders: [[u8; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];

        for order in orders {
            let now = Instant::now();
            let mut state = TransferState::new(4, config(), now).unwrap();
            let mut last = AcceptOutcome::Dropped;
            for sequence in order {
                last = state
                    .accept(&packet(false, sequence, parts[usize::from(sequence)]), now)
                    .unwrap();
            }
            match last {
                AcceptOutcome::Finished { document, .. } => assert_eq!(document, expected),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn test_flagged_packet_dropped_when_not_awaiting() {
        let now = Instant::now();
        let mut state = TransferState::new(5, config(), now).unwrap();
        state.accept(&packet(false, 0, "a"), now).unwrap();

        let outcome = state.accept(&packet(true, 1, "b"), now).unwrap();
        assert_eq!(outcome, AcceptOutcome::Dropped);
        assert_eq!(state.missing_sequences(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fresh_packet_dropped_while_awaiting() {
        let start = Instant::now();
        let mut state = TransferState::new(2, config(), start).unwrap();
        state.accept(&packet(false, 0, "a"), start).unwrap();
        let later = start + Duration::from_millis(200);
        assert!(matches!(
            state.review(later).unwrap(),
            ReviewOutcome::Stalled { .. }
        ));

        assert_eq!(
            state.accept(&packet(false, 1, "b"), later).unwrap(),
            AcceptOutcome::Dropped
        );
        assert!(matches!(
            state.accept(&packet(true, 1, "b"), later).unwrap(),
            AcceptOutcome::Finished { .. }
        ));
    }

    #[test]
    fn test_out_of_range_sequence_dropped() {
        let now = Instant::now();
        let mut state = TransferState::new(3, config(), now).unwrap();
        assert_eq!(
            state.accept(&packet(false, 3, "x"), now).unwrap(),
            AcceptOutcome::Dropped
        );
        assert_eq!(state.wave_size(), 3);
    }

    #[test]
    fn test_multi_wave_split() {
        let parts = fragments(200);
        let now = Instant::now();
        let mut state = TransferState::new(200, config(), now).unwrap();
        assert_eq!(state.wave_size(), 128);

        for (sequence, part) in parts[..128].iter().enumerate() {
            let outcome = state
                .accept(&packet(false, sequence as u8, part), now)
                .unwrap();
            if sequence < 127 {
                assert_eq!(outcome, AcceptOutcome::Stored);
            } else {
                assert_eq!(
                    outcome,
                    AcceptOutcome::WaveComplete {
                        ack: encode_ack(20)
                    }
                );
            }
        }
        assert_eq!(state.wave(), 1);
        assert_eq!(state.wave_size(), 72);
        assert_eq!(state.total_remaining(), 72);

        let mut last = AcceptOutcome::Dropped;
        for (sequence, part) in parts[128..].iter().enumerate().rev() {
            last = state
                .accept(&packet(false, sequence as u8, part), now)
                .unwrap();
        }
        match last {
            AcceptOutcome::Finished { ack, document } => {
                assert_eq!(ack[0], 0);
                assert_eq!(document, parts.concat());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_stall_review_builds_missing_list() {
        let start = Instant::now();
        let mut state = TransferState::new(5, config(), start).unwrap();
        for sequence in [0, 1, 2, 4] {
            state.accept(&packet(false, sequence, "x"), start).unwrap();
        }

        let early = start + Duration::from_millis(100);
        assert_eq!(state.review(early).unwrap(), ReviewOutcome::Idle);

        let late = start + Duration::from_millis(150);
        let ReviewOutcome::Stalled { missing_list } = state.review(late).unwrap() else {
            panic!("wave should have stalled");
        };
        assert_eq!(missing_list[0], 0x88);
        assert_eq!(decode_missing_list(&missing_list, 5).unwrap(), vec![3]);
        assert!(state.is_awaiting_missed_packets());
    }

    #[test]
    fn test_finished_transfer_never_stalls() {
        let start = Instant::now();
        let mut state = TransferState::new(2, config(), start).unwrap();
        state.accept(&packet(false, 0, "y"), start).unwrap();
        state.accept(&packet(false, 1, "z"), start).unwrap();
        assert!(matches!(
            state.review(start + Duration::from_secs(10)),
            Ok(ReviewOutcome::Idle)
        ));
    }

    #[test]
    fn test_retransmission_rounds_are_capped() {
        let cfg = TransferConfig {
            max_retransmission_rounds: 2,
            ..config()
        };
        let mut now = Instant::now();
        let mut state = TransferState::new(3, cfg, now).unwrap();
        state.accept(&packet(false, 0, "a"), now).unwrap();

        for _ in 0..2 {
            now += Duration::from_millis(200);
            assert!(matches!(
                state.review(now).unwrap(),
                ReviewOutcome::Stalled { .. }
            ));
        }
        now += Duration::from_millis(200);
        assert!(matches!(
            state.review(now),
            Err(NexusError::RetransmissionLimit { wave: 0, rounds: 2 })
        ));
    }

    #[test]
    fn test_stall_restarts_silence_window() {
        let start = Instant::now();
        let mut state = TransferState::new(3, config(), start).unwrap();
        state.accept(&packet(false, 0, "a"), start).unwrap();

        let first = start + Duration::from_millis(150);
        assert!(matches!(
            state.review(first).unwrap(),
            ReviewOutcome::Stalled { .. }
        ));
        assert_eq!(
            state.review(first + Duration::from_millis(100)).unwrap(),
            ReviewOutcome::Idle
        );
        assert!(matches!(
            state.review(first + Duration::from_millis(150)).unwrap(),
            ReviewOutcome::Stalled { .. }
        ));
    }

    #[test]
    fn test_next_wave_measured_from_acknowledgment() {
        let cfg = TransferConfig {
            max_wave_size: 2,
            ..config()
        };
        let start = Instant::now();
        let mut state = TransferState::new(3, cfg, start).unwrap();
        state.accept(&packet(false, 0, "a"), start).unwrap();
        assert!(matches!(
            state.accept(&packet(false, 1, "b"), start).unwrap(),
            AcceptOutcome::WaveComplete { .. }
        ));

        // confirmation of the ack took 120 ms
        state.acknowledged(start + Duration::from_millis(120));
        assert_eq!(
            state.review(start + Duration::from_millis(200)).unwrap(),
            ReviewOutcome::Idle
        );
        assert!(matches!(
            state.review(start + Duration::from_millis(300)).unwrap(),
            ReviewOutcome::Stalled { .. }
        ));
    }

    #[test]
    fn test_invalid_utf8_document_is_malformed() {
        let now = Instant::now();
        let mut state = TransferState::new(1, config(), now).unwrap();
        let raw = Packet::new(false, 0, vec![0xFF, 0xFE]).to_bytes();
        assert!(matches!(
            state.accept(&raw, now),
            Err(NexusError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_multibyte_character_split_across_packets() {
        let now = Instant::now();
        let mut state = TransferState::new(2, config(), now).unwrap();
        let snowman = "\u{2603}".as_bytes();
        state
            .accept(&Packet::new(false, 0, snowman[..1].to_vec()).to_bytes(), now)
            .unwrap();
        let outcome = state
            .accept(&Packet::new(false, 1, snowman[1..].to_vec()).to_bytes(), now)
            .unwrap();
        assert!(matches!(outcome, AcceptOutcome::Finished { document, .. } if document == "\u{2603}"));
    }

    fn start_session(
        total_packets: u32,
    ) -> (
        MockRadio,
        TransferSession,
        oneshot::Receiver<Result<String>>,
        mpsc::UnboundedSender<Bytes>,
    ) {
        let (radio, mut events) = MockRadio::new(MockScript::default());
        let completions = Arc::new(Completions::default());
        {
            let completions = completions.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if !matches!(event, RadioEvent::CharacteristicChanged { .. }) {
                        completions.route(&event);
                    }
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (session, done) = TransferSession::start(
            Arc::new(radio.clone()),
            completions,
            TransferParams {
                device: DeviceId::from("AA:AA:AA:AA:AA:AA"),
                sink: CharacteristicRole::MissingPacketWrite.uuid(),
                total_packets,
                config: config(),
                write_timeout: Duration::from_secs(1),
            },
            rx,
        )
        .unwrap();
        (radio, session, done, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_emits_one_missing_list_per_silence() {
        let (radio, _session, done, tx) = start_session(5);
        for sequence in [0, 1, 2, 4] {
            tx.send(packet(false, sequence, "x")).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        let sink = CharacteristicRole::MissingPacketWrite.uuid();
        let writes = radio.writes_to(sink);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 20);
        assert_eq!(writes[0][0], 0x88);
        assert!(writes[0][1..].iter().all(|b| *b == 0));

        assert!(matches!(
            done.await.unwrap(),
            Err(NexusError::RetransmissionLimit { wave: 0, rounds: 5 })
        ));
        let writes = radio.writes_to(sink);
        assert_eq!(writes.len(), 5);
        assert!(writes.iter().all(|list| *list == writes[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_retransmission_is_requested_again() {
        let (radio, _session, done, tx) = start_session(3);
        tx.send(packet(false, 0, "{\"a\"")).unwrap();
        tx.send(packet(false, 2, "}")).unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        let writes = radio.writes_to(CharacteristicRole::MissingPacketWrite.uuid());
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][0], 0xA0);
        assert_eq!(writes[1], writes[0]);

        assert!(matches!(
            done.await.unwrap(),
            Err(NexusError::RetransmissionLimit { rounds: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_completes_transfer() {
        let (radio, _session, done, tx) = start_session(3);
        tx.send(packet(false, 0, "{\"a\"")).unwrap();
        tx.send(packet(false, 2, "}")).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(packet(true, 1, ":1")).unwrap();

        assert_eq!(done.await.unwrap().unwrap(), "{\"a\":1}");
        let writes = radio.writes_to(CharacteristicRole::MissingPacketWrite.uuid());
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][0], 0xA0);
        assert_eq!(writes[1][0], 0x00);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_acknowledges_each_wave() {
        let parts = fragments(200);
        let (radio, session, done, tx) = start_session(200);
        for (index, part) in parts.iter().enumerate() {
            let sequence = if index < 128 { index } else { index - 128 };
            tx.send(packet(false, sequence as u8, part)).unwrap();
        }

        assert_eq!(done.await.unwrap().unwrap(), parts.concat());
        let acks = radio.writes_to(CharacteristicRole::MissingPacketWrite.uuid());
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|ack| ack.iter().all(|b| *b == 0)));

        tokio::task::yield_now().await;
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_partial_transfer() {
        let (radio, session, done, tx) = start_session(5);
        tx.send(packet(false, 0, "x")).unwrap();
        tokio::task::yield_now().await;

        session.close();
        assert!(done.await.is_err());
        assert!(!session.is_active());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(radio.count(|c| matches!(c, RadioCall::Write(..))), 0);
    }
}
