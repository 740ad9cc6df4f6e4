//! An in-process key for tests and demos.
//!
//! `SimulatedKey` implements [`Transport`] on top of a small model of a real
//! key:
//!
//! - SELECT by AID, answering `6A 82` for unknown applications.
//! - The management application's READ CONFIG and WRITE CONFIG, backed by a
//!   [`DeviceInfo`] that writes actually modify.
//! - Responses longer than the configured chunk size are split with `61 XX`
//!   and served through GET RESPONSE.
//! - Chained commands (CLA bit `0x10`) are buffered until the last frame.
//! - Every other application echoes the command data back.
//!
//! Test hooks let a caller pull the plug, script a status word for the next
//! command with a given INS, hold exchanges at a gate, and inspect every
//! frame received together with the in-flight high-water mark.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use keylink_core::apdu::command::{CLA_CHAINING, INS_GET_RESPONSE, INS_SELECT};
use keylink_core::management::{
    encode_read_response, parse_write_payload, INS_READ_CONFIG, INS_WRITE_CONFIG,
};
use keylink_core::{Aid, CommandApdu, DeviceInfo, ResponseApdu, StatusWord};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{LinkState, Transport, TransportError};

/// Mutable model of the key, guarded by a mutex that is never held across
/// an `.await`.
#[derive(Debug)]
struct KeyModel {
    info: DeviceInfo,
    selected: Option<Aid>,
    /// Response bytes waiting for GET RESPONSE.
    pending_out: Vec<u8>,
    /// Data of a command chain in progress: (INS, data so far).
    chain: Option<(u8, Vec<u8>)>,
    /// Scripted answers: the next command with this INS gets this status.
    scripted: VecDeque<(u8, StatusWord)>,
    /// Largest response payload sent in one frame.
    response_chunk: usize,
    reboots: usize,
    frames: Vec<Vec<u8>>,
}

/// Decrements the in-flight counter when an exchange ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A simulated key implementing [`Transport`].
pub struct SimulatedKey {
    model: Mutex<KeyModel>,
    link_tx: watch::Sender<LinkState>,
    gate_tx: watch::Sender<bool>,
    frames_tx: watch::Sender<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    extended_length: bool,
}

impl SimulatedKey {
    /// Creates a plugged-in key reporting `info`.
    pub fn new(info: DeviceInfo) -> Self {
        let (link_tx, _) = watch::channel(LinkState::Up);
        let (gate_tx, _) = watch::channel(true);
        let (frames_tx, _) = watch::channel(0);
        Self {
            model: Mutex::new(KeyModel {
                info,
                selected: None,
                pending_out: Vec::new(),
                chain: None,
                scripted: VecDeque::new(),
                response_chunk: 256,
                reboots: 0,
                frames: Vec::new(),
            }),
            link_tx,
            gate_tx,
            frames_tx,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            extended_length: false,
        }
    }

    /// Splits responses longer than `chunk` bytes with `61 XX`.
    pub fn with_response_chunk(self, chunk: usize) -> Self {
        self.lock().response_chunk = chunk.clamp(1, 256);
        self
    }

    /// Makes the key advertise extended length support.
    pub fn with_extended_length(mut self, supported: bool) -> Self {
        self.extended_length = supported;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeyModel> {
        // A poisoned lock only means a test panicked mid-exchange; the model
        // is still usable for the assertions that follow.
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Link control ─────────────────────────────────────────────────────────

    /// Drops the link.  The key forgets its selection and any partial state.
    pub fn unplug(&self) {
        {
            let mut model = self.lock();
            model.selected = None;
            model.pending_out.clear();
            model.chain = None;
        }
        info!("simulated key unplugged");
        self.link_tx.send_replace(LinkState::Down);
    }

    /// Restores the link.  Does nothing if it is already up.
    pub fn plug(&self) {
        let changed = self.link_tx.send_if_modified(|state| {
            let was_down = *state == LinkState::Down;
            *state = LinkState::Up;
            was_down
        });
        if changed {
            info!("simulated key plugged in");
        }
    }

    // ── Exchange control ─────────────────────────────────────────────────────

    /// Holds every exchange that starts from now on until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gate_tx.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate_tx.send_replace(true);
    }

    /// The next command with instruction `ins` is answered with `status` and
    /// no data instead of being processed.
    pub fn script_status(&self, ins: u8, status: StatusWord) {
        self.lock().scripted.push_back((ins, status));
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// Every frame received, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    /// The INS byte of every frame received, in order.
    pub fn instructions(&self) -> Vec<u8> {
        self.lock()
            .frames
            .iter()
            .filter_map(|f| f.get(1).copied())
            .collect()
    }

    /// Waits until at least `count` frames have been received.
    pub async fn wait_for_frames(&self, count: usize) {
        let mut rx = self.frames_tx.subscribe();
        wait_until(&mut rx, |seen| *seen >= count).await;
    }

    /// Highest number of exchanges ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Current device state, reflecting any writes.
    pub fn device_info(&self) -> DeviceInfo {
        self.lock().info.clone()
    }

    /// Number of writes that requested a reboot.
    pub fn reboots(&self) -> usize {
        self.lock().reboots
    }

    pub fn selected(&self) -> Option<Aid> {
        self.lock().selected
    }

    // ── Command processing ───────────────────────────────────────────────────

    fn record(&self, frame: &[u8]) {
        let count = {
            let mut model = self.lock();
            model.frames.push(frame.to_vec());
            model.frames.len()
        };
        self.frames_tx.send_replace(count);
    }

    fn process(&self, frame: &[u8]) -> ResponseApdu {
        let mut model = self.lock();

        let mut cmd = match CommandApdu::parse(frame) {
            Ok(cmd) => cmd,
            Err(_) => return ResponseApdu::status_only(StatusWord::WRONG_LENGTH),
        };

        if let Some(pos) = model.scripted.iter().position(|(ins, _)| *ins == cmd.ins) {
            if let Some((_, status)) = model.scripted.remove(pos) {
                return ResponseApdu::status_only(status);
            }
        }

        if cmd.is_chained() {
            let continues = matches!(&model.chain, Some((ins, _)) if *ins == cmd.ins);
            if continues {
                if let Some((_, data)) = model.chain.as_mut() {
                    data.extend_from_slice(&cmd.data);
                }
            } else {
                model.chain = Some((cmd.ins, std::mem::take(&mut cmd.data)));
            }
            return ResponseApdu::status_only(StatusWord::SUCCESS);
        }
        if let Some((ins, mut data)) = model.chain.take() {
            if ins != cmd.ins {
                return ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED);
            }
            data.extend_from_slice(&cmd.data);
            cmd.data = data;
            cmd.cla &= !CLA_CHAINING;
        }

        let selected = model.selected;
        match cmd.ins {
            INS_SELECT => model.select(&cmd),
            INS_GET_RESPONSE => model.get_response(),
            _ => match selected {
                None => ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED),
                Some(aid) if aid == Aid::MANAGEMENT => model.management(&cmd),
                Some(_) => model.respond(cmd.data),
            },
        }
    }
}

impl KeyModel {
    fn select(&mut self, cmd: &CommandApdu) -> ResponseApdu {
        let Some(aid) = Aid::from_bytes(&cmd.data) else {
            return ResponseApdu::status_only(StatusWord::NOT_FOUND);
        };
        self.selected = Some(aid);
        self.pending_out.clear();
        if aid == Aid::MANAGEMENT {
            let banner = match self.info.version {
                Some(version) => format!("Virtual mgr - FW version {version}"),
                None => "Virtual mgr".to_string(),
            };
            self.respond(banner.into_bytes())
        } else {
            ResponseApdu::status_only(StatusWord::SUCCESS)
        }
    }

    fn management(&mut self, cmd: &CommandApdu) -> ResponseApdu {
        match cmd.ins {
            INS_READ_CONFIG => match encode_read_response(&self.info) {
                Ok(payload) => self.respond(payload),
                Err(_) => ResponseApdu::status_only(StatusWord::NO_PRECISE_DIAGNOSIS),
            },
            INS_WRITE_CONFIG => {
                if self.info.config_locked {
                    return ResponseApdu::status_only(StatusWord::SECURITY_STATUS_NOT_SATISFIED);
                }
                let Ok(config) = parse_write_payload(&cmd.data) else {
                    return ResponseApdu::status_only(StatusWord::WRONG_DATA);
                };
                for (interface, enabled) in config.enabled {
                    self.info.capabilities.enabled.insert(interface, enabled);
                }
                if config.reboot {
                    self.reboots += 1;
                }
                ResponseApdu::status_only(StatusWord::SUCCESS)
            }
            _ => ResponseApdu::status_only(StatusWord::INS_NOT_SUPPORTED),
        }
    }

    fn respond(&mut self, data: Vec<u8>) -> ResponseApdu {
        self.pending_out = data;
        self.next_chunk()
    }

    fn get_response(&mut self) -> ResponseApdu {
        if self.pending_out.is_empty() {
            return ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED);
        }
        self.next_chunk()
    }

    fn next_chunk(&mut self) -> ResponseApdu {
        let take = self.pending_out.len().min(self.response_chunk);
        let chunk: Vec<u8> = self.pending_out.drain(..take).collect();
        let remaining = self.pending_out.len();
        if remaining == 0 {
            ResponseApdu::success(chunk)
        } else {
            // 256 or more remaining is announced as 0x00.
            let announced = if remaining >= 256 { 0 } else { remaining as u8 };
            ResponseApdu::new(chunk, StatusWord::from_bytes(StatusWord::MORE_DATA_SW1, announced))
        }
    }
}

/// Waits until `rx` holds a value matching `pred`.  Returns `false` if the
/// sender went away first.
async fn wait_until<T>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> bool {
    rx.wait_for(pred).await.is_ok()
}

#[async_trait]
impl Transport for SimulatedKey {
    fn is_connected(&self) -> bool {
        *self.link_tx.borrow() == LinkState::Up
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_tx.subscribe()
    }

    fn supports_extended_length(&self) -> bool {
        self.extended_length
    }

    async fn transmit(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::LinkDown);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.record(frame);

        let mut gate = self.gate_tx.subscribe();
        let mut link = self.link_tx.subscribe();
        tokio::select! {
            _ = wait_until(&mut gate, |open| *open) => {}
            _ = wait_until(&mut link, |state| *state == LinkState::Down) => {
                return Err(TransportError::LinkDown);
            }
        }
        if !self.is_connected() {
            return Err(TransportError::LinkDown);
        }

        let response = self.process(frame);
        debug!(
            ins = frame.get(1).copied().unwrap_or_default(),
            status = %response.status(),
            len = response.data().len(),
            "simulated key answered"
        );
        Ok(response.to_bytes())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
