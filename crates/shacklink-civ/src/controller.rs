//! The CI-V controller: request/response state machine over the serial
//! stream.
//!
//! The controller keeps one command slot per logical operation
//! (get-frequency, set-PTT, ...). Issuing an operation overwrites its
//! slot -- latest wins, there is no queue -- and inserts the slot into
//! a deduplicated in-flight set. A background task retries any slot
//! that has been pending longer than 500 ms (no retry cap: retries
//! continue until the response arrives or the stream dies), polls
//! meters once a second, and enforces the PTT and tune timeouts.
//!
//! Inbound CI-V packets are dispatched on their command byte under the
//! single state lock. A decoder clears the matching pending slot and
//! reports whether the packet should still be forwarded to external
//! serial consumers: `false` when it answered a request the controller
//! itself initiated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, trace};

use shacklink_core::{
    AgcMode, Band, Config, Error, Filter, Mode, PreampLevel, RadioEvent, Result, SplitMode,
    TuningStep,
};

use crate::bcd;
use crate::civ::{ACK, MIN_PACKET_LEN, NAK, PREAMBLE, TERMINATOR};
use crate::commands::{build_request, SlotId};

/// Pending commands older than this are resent.
pub const COMMAND_RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// Meter/frequency poll period.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// PTT left keyed this long is forced off (US operators must identify
/// at least once every ten minutes).
pub const PTT_TIMEOUT: Duration = Duration::from_secs(600);

/// The antenna tuner is forced off after this long.
pub const TUNE_TIMEOUT: Duration = Duration::from_secs(30);

/// The radio does not announce tune-finished on its own; poll transmit
/// status this long after a tune start.
const TUNE_RECHECK_DELAY: Duration = Duration::from_secs(1);

const ON: u8 = 1;
const OFF: u8 = 0;

/// Controller knobs lifted from the client [`Config`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// CI-V address of the radio.
    pub civ_address: u8,
    /// CI-V address of this controller.
    pub controller_address: u8,
    /// Switch the radio into data mode when keying PTT.
    pub set_data_mode_on_tx: bool,
    /// Log every CI-V packet.
    pub debug_packets: bool,
}

impl From<&Config> for ControllerOptions {
    fn from(cfg: &Config) -> Self {
        ControllerOptions {
            civ_address: cfg.civ_address,
            controller_address: cfg.controller_address,
            set_data_mode_on_tx: cfg.set_data_mode_on_tx,
            debug_packets: cfg.debug_packets,
        }
    }
}

/// One logical command slot.
#[derive(Debug, Clone)]
struct CmdSlot {
    bytes: Vec<u8>,
    pending: bool,
    sent_at: Instant,
}

/// Mirrored radio state plus the command slots.
#[derive(Debug)]
struct CivState {
    slots: HashMap<SlotId, CmdSlot>,
    pending: Vec<SlotId>,

    freq: u64,
    sub_freq: u64,
    ptt: bool,
    tune: bool,
    pwr: u8,
    rf_gain: u8,
    sql: u8,
    nr_level: u8,
    nr_enabled: bool,
    mode: Mode,
    data_mode: bool,
    filter: Filter,
    sub_mode: Mode,
    sub_data_mode: bool,
    sub_filter: Filter,
    band: Band,
    /// Last tuned frequency per amateur band, for band-change-with-memory.
    band_memory: [u64; 12],
    preamp: PreampLevel,
    agc: AgcMode,
    tuning_step: TuningStep,
    vfo_b_active: bool,
    split: SplitMode,

    last_s_at: Instant,
    last_ovf_at: Instant,
    last_swr_at: Instant,
    last_vfo_freq_at: Instant,

    ptt_timer: Option<JoinHandle<()>>,
    tune_timer: Option<JoinHandle<()>>,
}

impl CivState {
    fn new() -> Self {
        let now = Instant::now();
        // Backdate the "last received" stamps so the first poll tick
        // is never suppressed.
        let past = now.checked_sub(STATUS_POLL_INTERVAL).unwrap_or(now);
        CivState {
            slots: HashMap::new(),
            pending: Vec::new(),
            freq: 0,
            sub_freq: 0,
            ptt: false,
            tune: false,
            pwr: 0,
            rf_gain: 0,
            sql: 0,
            nr_level: 0,
            nr_enabled: false,
            mode: Mode::LSB,
            data_mode: false,
            filter: Filter::Fil1,
            sub_mode: Mode::LSB,
            sub_data_mode: false,
            sub_filter: Filter::Fil1,
            band: Band::General,
            band_memory: [0; 12],
            preamp: PreampLevel::OFF,
            agc: AgcMode::Fast,
            tuning_step: TuningStep::default(),
            vfo_b_active: false,
            split: SplitMode::Off,
            last_s_at: past,
            last_ovf_at: past,
            last_swr_at: past,
            last_vfo_freq_at: past,
            ptt_timer: None,
            tune_timer: None,
        }
    }

    fn is_pending(&self, slot: SlotId) -> bool {
        self.slots.get(&slot).map(|s| s.pending).unwrap_or(false)
    }

    /// Overwrite `slot` with a fresh request and add it to the
    /// in-flight set (deduplicated). Any previous request in the slot
    /// is abandoned.
    fn mark_pending(&mut self, slot: SlotId, bytes: Vec<u8>) {
        self.slots.insert(
            slot,
            CmdSlot {
                bytes,
                pending: true,
                sent_at: Instant::now(),
            },
        );
        if !self.pending.contains(&slot) {
            self.pending.push(slot);
        }
    }

    /// Clear `slot`'s pending flag and drop it from the in-flight set.
    /// Returns `true` when the slot was actually pending.
    fn clear_pending(&mut self, slot: SlotId) -> bool {
        let was = self.is_pending(slot);
        if let Some(s) = self.slots.get_mut(&slot) {
            s.pending = false;
        }
        self.pending.retain(|s| *s != slot);
        was
    }

    /// Relocate the band index for `freq` and remember the frequency
    /// in the band's memory.
    fn relocate_band(&mut self, freq: u64) {
        self.band = Band::from_freq(freq);
        if let Some(i) = self.band.index() {
            self.band_memory[i] = freq;
        }
    }
}

/// Follow-up operations a decoder schedules; executed after the state
/// lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    GetVd,
    GetBothVfoFreq,
    DelayedTransmitStatus,
}

/// Point-in-time copy of the mirrored radio state.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioState {
    pub freq: u64,
    pub sub_freq: u64,
    pub ptt: bool,
    pub tune: bool,
    pub pwr: u8,
    pub rf_gain: u8,
    pub sql: u8,
    pub nr_level: u8,
    pub nr_enabled: bool,
    pub mode: Mode,
    pub data_mode: bool,
    pub filter: Filter,
    pub sub_mode: Mode,
    pub sub_data_mode: bool,
    pub sub_filter: Filter,
    pub band: Band,
    pub preamp: PreampLevel,
    pub agc: AgcMode,
    pub tuning_step: TuningStep,
    pub vfo_b_active: bool,
    pub split: SplitMode,
}

struct Inner {
    opts: ControllerOptions,
    serial_tx: mpsc::UnboundedSender<Vec<u8>>,
    events: broadcast::Sender<RadioEvent>,
    state: Mutex<CivState>,
    /// Signalled when a new command becomes pending, so the retry loop
    /// recomputes its deadline.
    wake: Notify,
    shutdown: Notify,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the CI-V controller. Cheap to clone; all clones share the
/// same state mirror.
#[derive(Clone)]
pub struct CivController {
    inner: Arc<Inner>,
}

impl CivController {
    /// Create a controller that transmits requests through `serial_tx`
    /// (the serial stream's byte sender) and publishes state changes on
    /// `events`.
    pub fn new(
        opts: ControllerOptions,
        serial_tx: mpsc::UnboundedSender<Vec<u8>>,
        events: broadcast::Sender<RadioEvent>,
    ) -> CivController {
        CivController {
            inner: Arc::new(Inner {
                opts,
                serial_tx,
                events,
                state: Mutex::new(CivState::new()),
                wake: Notify::new(),
                shutdown: Notify::new(),
                loop_task: Mutex::new(None),
            }),
        }
    }

    /// Issue the full initial poll (frequencies, modes, levels, meters,
    /// split) and start the retry/poll loop.
    pub fn start(&self) -> Result<()> {
        self.get_freq()?;
        self.get_both_vfo_freq()?;
        self.get_both_vfo_mode()?;
        self.get_pwr()?;
        self.get_transmit_status()?;
        self.get_preamp()?;
        self.get_agc()?;
        self.get_vd()?;
        self.get_s()?;
        self.get_ovf()?;
        self.get_swr()?;
        self.get_tuning_step()?;
        self.get_rf_gain()?;
        self.get_sql()?;
        self.get_nr()?;
        self.get_nr_enabled()?;
        self.get_split()?;

        let ctrl = self.clone();
        let task = tokio::spawn(async move { ctrl.run_loop().await });
        *self.inner.loop_task.lock().expect("loop handle poisoned") = Some(task);
        Ok(())
    }

    /// Stop the background loop and cancel the timers. Returns once
    /// the loop task has acknowledged the shutdown by exiting.
    pub async fn shutdown(&self) {
        let (ptt_timer, tune_timer) = {
            let mut st = self.lock();
            (st.ptt_timer.take(), st.tune_timer.take())
        };
        if let Some(t) = ptt_timer {
            t.abort();
        }
        if let Some(t) = tune_timer {
            t.abort();
        }

        self.inner.shutdown.notify_one();
        let task = self
            .inner
            .loop_task
            .lock()
            .expect("loop handle poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Current state mirror snapshot.
    pub fn state(&self) -> RadioState {
        let st = self.lock();
        RadioState {
            freq: st.freq,
            sub_freq: st.sub_freq,
            ptt: st.ptt,
            tune: st.tune,
            pwr: st.pwr,
            rf_gain: st.rf_gain,
            sql: st.sql,
            nr_level: st.nr_level,
            nr_enabled: st.nr_enabled,
            mode: st.mode,
            data_mode: st.data_mode,
            filter: st.filter,
            sub_mode: st.sub_mode,
            sub_data_mode: st.sub_data_mode,
            sub_filter: st.sub_filter,
            band: st.band,
            preamp: st.preamp,
            agc: st.agc,
            tuning_step: st.tuning_step,
            vfo_b_active: st.vfo_b_active,
            split: st.split,
        }
    }

    /// Slots currently in flight.
    pub fn pending_slots(&self) -> Vec<SlotId> {
        self.lock().pending.clone()
    }

    /// Checks the pending-set invariant: a slot is in the in-flight
    /// set iff its pending flag is set. Exposed for tests.
    #[doc(hidden)]
    pub fn pending_invariant_holds(&self) -> bool {
        let st = self.lock();
        let flagged: Vec<SlotId> = st
            .slots
            .iter()
            .filter(|(_, s)| s.pending)
            .map(|(id, _)| *id)
            .collect();
        flagged.iter().all(|id| st.pending.contains(id))
            && st.pending.iter().all(|id| st.is_pending(*id))
            && st.pending.len() == flagged.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CivState> {
        self.inner.state.lock().expect("civ state poisoned")
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Hand raw bytes to the radio through the serial stream.
    fn transmit(&self, pkt: Vec<u8>) -> Result<()> {
        if self.inner.opts.debug_packets {
            debug!(pkt = %hex(&pkt), "civ send");
        }
        self.inner
            .serial_tx
            .send(pkt)
            .map_err(|_| Error::NotConnected)
    }

    /// Build, register, and send a request for `slot`. The slot's
    /// previous request, if any, is overwritten.
    fn send_slot(&self, slot: SlotId, data: &[u8]) -> Result<()> {
        let pkt = build_request(
            self.inner.opts.civ_address,
            self.inner.opts.controller_address,
            slot,
            data,
        );
        {
            let mut st = self.lock();
            st.mark_pending(slot, pkt.clone());
        }
        self.inner.wake.notify_one();
        self.transmit(pkt)
    }

    // -----------------------------------------------------------------
    // Get operations
    // -----------------------------------------------------------------

    /// Read the active VFO frequency.
    pub fn get_freq(&self) -> Result<()> {
        self.send_slot(SlotId::GetFreq, &[])
    }

    /// Read the active VFO operating mode.
    pub fn get_mode(&self) -> Result<()> {
        self.send_slot(SlotId::GetMode, &[])
    }

    /// Read the RF power level.
    pub fn get_pwr(&self) -> Result<()> {
        self.send_slot(SlotId::GetPwr, &[])
    }

    /// Read transmit and tuner status (two requests).
    pub fn get_transmit_status(&self) -> Result<()> {
        self.send_slot(SlotId::GetTransmitStatus, &[])?;
        self.send_slot(SlotId::GetTuneStatus, &[])
    }

    /// Read the preamp setting.
    pub fn get_preamp(&self) -> Result<()> {
        self.send_slot(SlotId::GetPreamp, &[])
    }

    /// Read the AGC setting.
    pub fn get_agc(&self) -> Result<()> {
        self.send_slot(SlotId::GetAgc, &[])
    }

    /// Read the drain voltage meter.
    pub fn get_vd(&self) -> Result<()> {
        self.send_slot(SlotId::GetVd, &[])
    }

    /// Read the S-meter.
    pub fn get_s(&self) -> Result<()> {
        self.send_slot(SlotId::GetS, &[])
    }

    /// Read the overflow indicator.
    pub fn get_ovf(&self) -> Result<()> {
        self.send_slot(SlotId::GetOvf, &[])
    }

    /// Read the SWR meter.
    pub fn get_swr(&self) -> Result<()> {
        self.send_slot(SlotId::GetSwr, &[])
    }

    /// Read the tuning step.
    pub fn get_tuning_step(&self) -> Result<()> {
        self.send_slot(SlotId::GetTuningStep, &[])
    }

    /// Read the RF gain.
    pub fn get_rf_gain(&self) -> Result<()> {
        self.send_slot(SlotId::GetRfGain, &[])
    }

    /// Read the squelch level.
    pub fn get_sql(&self) -> Result<()> {
        self.send_slot(SlotId::GetSql, &[])
    }

    /// Read the noise reduction level.
    pub fn get_nr(&self) -> Result<()> {
        self.send_slot(SlotId::GetNr, &[])
    }

    /// Read whether noise reduction is enabled.
    pub fn get_nr_enabled(&self) -> Result<()> {
        self.send_slot(SlotId::GetNrEnabled, &[])
    }

    /// Read the split state.
    pub fn get_split(&self) -> Result<()> {
        self.send_slot(SlotId::GetSplit, &[])
    }

    /// Read both VFO frequencies (two requests).
    pub fn get_both_vfo_freq(&self) -> Result<()> {
        self.send_slot(SlotId::GetMainVfoFreq, &[])?;
        self.send_slot(SlotId::GetSubVfoFreq, &[])
    }

    /// Read both VFO modes (two requests).
    pub fn get_both_vfo_mode(&self) -> Result<()> {
        self.send_slot(SlotId::GetMainVfoMode, &[])?;
        self.send_slot(SlotId::GetSubVfoMode, &[])
    }

    // -----------------------------------------------------------------
    // Set operations
    // -----------------------------------------------------------------

    /// Set the RF power level.
    pub fn set_pwr(&self, level: u8) -> Result<()> {
        self.send_slot(SlotId::SetPwr, &bcd::encode_level(level))
    }

    /// Nudge RF power up one step.
    pub fn inc_pwr(&self) -> Result<()> {
        let pwr = self.lock().pwr;
        if pwr < 255 {
            self.set_pwr(pwr + 1)
        } else {
            Ok(())
        }
    }

    /// Nudge RF power down one step.
    pub fn dec_pwr(&self) -> Result<()> {
        let pwr = self.lock().pwr;
        if pwr > 0 {
            self.set_pwr(pwr - 1)
        } else {
            Ok(())
        }
    }

    /// Set the RF gain.
    pub fn set_rf_gain(&self, level: u8) -> Result<()> {
        self.send_slot(SlotId::SetRfGain, &bcd::encode_level(level))
    }

    /// Nudge RF gain up.
    pub fn inc_rf_gain(&self) -> Result<()> {
        let v = self.lock().rf_gain;
        if v < 255 {
            self.set_rf_gain(v + 1)
        } else {
            Ok(())
        }
    }

    /// Nudge RF gain down.
    pub fn dec_rf_gain(&self) -> Result<()> {
        let v = self.lock().rf_gain;
        if v > 0 {
            self.set_rf_gain(v - 1)
        } else {
            Ok(())
        }
    }

    /// Set the squelch level.
    pub fn set_sql(&self, level: u8) -> Result<()> {
        self.send_slot(SlotId::SetSql, &bcd::encode_level(level))
    }

    /// Nudge squelch up.
    pub fn inc_sql(&self) -> Result<()> {
        let v = self.lock().sql;
        if v < 255 {
            self.set_sql(v + 1)
        } else {
            Ok(())
        }
    }

    /// Nudge squelch down.
    pub fn dec_sql(&self) -> Result<()> {
        let v = self.lock().sql;
        if v > 0 {
            self.set_sql(v - 1)
        } else {
            Ok(())
        }
    }

    /// Set the noise reduction level, enabling NR first if it is off.
    pub fn set_nr(&self, level: u8) -> Result<()> {
        if !self.lock().nr_enabled {
            self.toggle_nr()?;
        }
        self.send_slot(SlotId::SetNr, &bcd::encode_level(level))
    }

    /// Nudge NR up.
    pub fn inc_nr(&self) -> Result<()> {
        let v = self.lock().nr_level;
        if v < 255 {
            self.set_nr(v + 1)
        } else {
            Ok(())
        }
    }

    /// Nudge NR down.
    pub fn dec_nr(&self) -> Result<()> {
        let v = self.lock().nr_level;
        if v > 0 {
            self.set_nr(v - 1)
        } else {
            Ok(())
        }
    }

    /// Step the main VFO up by the current tuning step.
    pub fn inc_freq(&self) -> Result<()> {
        let (freq, step) = {
            let st = self.lock();
            (st.freq, st.tuning_step.hz() as u64)
        };
        self.set_main_vfo_freq(freq + step)
    }

    /// Step the main VFO down by the current tuning step.
    pub fn dec_freq(&self) -> Result<()> {
        let (freq, step) = {
            let st = self.lock();
            (st.freq, st.tuning_step.hz() as u64)
        };
        self.set_main_vfo_freq(freq.saturating_sub(step))
    }

    /// Set the main VFO frequency in hertz.
    pub fn set_main_vfo_freq(&self, freq_hz: u64) -> Result<()> {
        self.send_slot(SlotId::SetMainVfoFreq, &bcd::freq_to_bcd(freq_hz))
    }

    /// Set the sub VFO frequency in hertz.
    pub fn set_sub_vfo_freq(&self, freq_hz: u64) -> Result<()> {
        self.send_slot(SlotId::SetSubVfoFreq, &bcd::freq_to_bcd(freq_hz))
    }

    /// Cycle the operating mode forward.
    pub fn inc_operating_mode(&self) -> Result<()> {
        let (mode, filter) = {
            let mut st = self.lock();
            st.mode = st.mode.next();
            (st.mode, st.filter)
        };
        self.set_mode_and_filter(mode, filter)
    }

    /// Cycle the operating mode backward.
    pub fn dec_operating_mode(&self) -> Result<()> {
        let (mode, filter) = {
            let mut st = self.lock();
            st.mode = st.mode.prev();
            (st.mode, st.filter)
        };
        self.set_mode_and_filter(mode, filter)
    }

    /// Cycle the IF filter forward.
    pub fn inc_filter(&self) -> Result<()> {
        let (mode, filter) = {
            let mut st = self.lock();
            st.filter = st.filter.next();
            (st.mode, st.filter)
        };
        self.set_mode_and_filter(mode, filter)
    }

    /// Cycle the IF filter backward.
    pub fn dec_filter(&self) -> Result<()> {
        let (mode, filter) = {
            let mut st = self.lock();
            st.filter = st.filter.prev();
            (st.mode, st.filter)
        };
        self.set_mode_and_filter(mode, filter)
    }

    /// Set mode and filter together, then re-read both VFO modes.
    pub fn set_mode_and_filter(&self, mode: Mode, filter: Filter) -> Result<()> {
        self.send_slot(SlotId::SetMode, &[mode.code(), filter.code()])?;
        self.get_both_vfo_mode()
    }

    /// Set mode, data flag, and filter on the sub VFO.
    pub fn set_sub_vfo_mode(&self, mode: Mode, data: bool, filter: Filter) -> Result<()> {
        self.send_slot(
            SlotId::SetSubVfoMode,
            &[mode.code(), u8::from(data), filter.code()],
        )
    }

    /// Key or unkey the transmitter.
    ///
    /// Keying arms a ten-minute timer that forces PTT off; when
    /// configured, data mode is switched on first.
    pub fn set_ptt(&self, enable: bool) -> Result<()> {
        if enable {
            if self.inner.opts.set_data_mode_on_tx && !self.lock().data_mode {
                self.set_data_mode(true)?;
            }
            let ctrl = self.clone();
            let timer = tokio::spawn(async move {
                sleep(PTT_TIMEOUT).await;
                debug!("PTT timeout, forcing off");
                let _ = ctrl.set_ptt(false);
            });
            let mut st = self.lock();
            if let Some(old) = st.ptt_timer.replace(timer) {
                old.abort();
            }
        }
        self.send_slot(SlotId::SetPtt, &[if enable { ON } else { OFF }])
    }

    /// Start or stop the antenna tuner. Ignored while transmitting.
    ///
    /// Starting arms a thirty-second timer that forces the tuner off.
    pub fn set_tune(&self, enable: bool) -> Result<()> {
        if self.lock().ptt {
            return Ok(());
        }
        let b = if enable {
            let ctrl = self.clone();
            let timer = tokio::spawn(async move {
                sleep(TUNE_TIMEOUT).await;
                debug!("tune timeout, forcing off");
                let _ = ctrl.set_tune(false);
            });
            let mut st = self.lock();
            if let Some(old) = st.tune_timer.replace(timer) {
                old.abort();
            }
            2 // 0 = off, 1 = on, 2 = start tuning
        } else {
            // The original controller sends 1 here; observed radio
            // behavior is identical for 0 and 1, so this is preserved.
            ON
        };
        self.send_slot(SlotId::SetTune, &[b])
    }

    /// Toggle the antenna tuner.
    pub fn toggle_tuner(&self) -> Result<()> {
        let tune = self.lock().tune;
        self.set_tune(!tune)
    }

    /// Switch data mode on or off. Enabling selects FIL1 alongside.
    pub fn set_data_mode(&self, enable: bool) -> Result<()> {
        let args = if enable { [ON, 0x01] } else { [OFF, OFF] };
        self.send_slot(SlotId::SetDataMode, &args)
    }

    /// Toggle data mode.
    pub fn toggle_data_mode(&self) -> Result<()> {
        let data_mode = self.lock().data_mode;
        self.set_data_mode(!data_mode)
    }

    /// Step up one band, tuning to the band's remembered frequency or
    /// its midpoint on first visit.
    pub fn inc_band(&self) -> Result<()> {
        let freq = {
            let st = self.lock();
            let next = st.band.next();
            let i = next.index().expect("next() never yields General");
            match st.band_memory[i] {
                0 => next.range().expect("amateur band has a range").midpoint(),
                f => f,
            }
        };
        self.set_main_vfo_freq(freq)
    }

    /// Step down one band, tuning to the remembered frequency or the
    /// band's lower edge on first visit.
    pub fn dec_band(&self) -> Result<()> {
        let freq = {
            let st = self.lock();
            let prev = st.band.prev();
            let i = prev.index().expect("prev() never yields General");
            match st.band_memory[i] {
                0 => prev.range().expect("amateur band has a range").low_hz,
                f => f,
            }
        };
        self.set_main_vfo_freq(freq)
    }

    /// Rotate the preamp setting (off, 1, 2, off).
    pub fn toggle_preamp(&self) -> Result<()> {
        let next = self.lock().preamp.next();
        self.send_slot(SlotId::SetPreamp, &[next.code()])
    }

    /// Rotate the AGC time constant (fast, mid, slow, fast).
    pub fn toggle_agc(&self) -> Result<()> {
        let next = self.lock().agc.next();
        self.send_slot(SlotId::SetAgc, &[next.code()])
    }

    /// Toggle noise reduction on or off.
    pub fn toggle_nr(&self) -> Result<()> {
        let enable = !self.lock().nr_enabled;
        self.send_slot(SlotId::SetNrEnabled, &[if enable { ON } else { OFF }])
    }

    /// Select a tuning step by its CI-V code (0..=13).
    pub fn set_tuning_step(&self, step: TuningStep) -> Result<()> {
        self.send_slot(SlotId::SetTuningStep, &[step.code()])
    }

    /// Select the next larger tuning step.
    pub fn inc_tuning_step(&self) -> Result<()> {
        let next = self.lock().tuning_step.next();
        self.set_tuning_step(next)
    }

    /// Select the next smaller tuning step.
    pub fn dec_tuning_step(&self) -> Result<()> {
        let prev = self.lock().tuning_step.prev();
        self.set_tuning_step(prev)
    }

    /// Select VFO A or B, then re-read both VFO modes.
    pub fn set_vfo(&self, vfo_b: bool) -> Result<()> {
        self.send_slot(SlotId::SetVfo, &[u8::from(vfo_b)])?;
        self.get_both_vfo_mode()
    }

    /// Switch to the inactive VFO.
    pub fn toggle_vfo(&self) -> Result<()> {
        let vfo_b = self.lock().vfo_b_active;
        self.set_vfo(!vfo_b)
    }

    /// Set the split/duplex state.
    pub fn set_split(&self, mode: SplitMode) -> Result<()> {
        self.send_slot(SlotId::SetSplit, &[mode.code()])
    }

    /// Cycle split: off, on, dup-, dup+, off.
    pub fn toggle_split(&self) -> Result<()> {
        let next = self.lock().split.next();
        self.set_split(next)
    }

    // -----------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------

    /// Decode one inbound CI-V packet, update the state mirror, and
    /// clear any pending slot it answers.
    ///
    /// Returns `true` when the packet should be forwarded to external
    /// serial consumers, `false` when it answered a request this
    /// controller initiated.
    pub fn handle_packet(&self, pkt: &[u8]) -> bool {
        if self.inner.opts.debug_packets {
            debug!(pkt = %hex(pkt), "civ recv");
        }

        // Minimum valid packet: preamble, to, from, cmd, terminator.
        if pkt.len() < MIN_PACKET_LEN
            || pkt[0] != PREAMBLE
            || pkt[1] != PREAMBLE
            || pkt[pkt.len() - 1] != TERMINATOR
        {
            return true;
        }

        // Address filtering stays disabled: with CI-V echo-back active
        // the stream carries our own outbound packets too, and strict
        // (to, from) checks would drop real radio traffic. The bytes
        // are pkt[2] and pkt[3] if filtering is ever reinstated.

        let cmd = pkt[4];
        let payload = &pkt[5..pkt.len() - 1];

        let mut events = Vec::new();
        let mut followups = Vec::new();
        let forward = {
            let mut st = self.lock();
            match cmd {
                0x00 | 0x03 | 0x05 => self.decode_freq(&mut st, payload, &mut events),
                0x01 | 0x04 | 0x06 => self.decode_mode(&mut st, payload, &mut events),
                0x02 => false,
                0x07 => self.decode_vfo(&mut st, payload, &mut followups),
                0x0F => self.decode_split(&mut st, payload, &mut events),
                0x10 => self.decode_tuning_step(&mut st, payload, &mut events),
                0x14 => self.decode_levels(&mut st, payload, &mut events),
                0x15 => self.decode_meters(&mut st, payload, &mut events),
                0x16 => self.decode_preamp_agc_nr(&mut st, payload, &mut events),
                0x1A => self.decode_data_mode_and_ovf(&mut st, payload, &mut events),
                0x1C => self.decode_transmit_status(&mut st, payload, &mut events, &mut followups),
                0x25 => self.decode_vfo_freq(&mut st, payload, &mut events),
                0x26 => self.decode_vfo_mode(&mut st, payload, &mut events),
                ACK | NAK => self.decode_ack(&mut st, cmd),
                _ => true,
            }
        };

        for event in events {
            self.emit(event);
        }
        for followup in followups {
            match followup {
                Followup::GetVd => {
                    let _ = self.get_vd();
                }
                Followup::GetBothVfoFreq => {
                    let _ = self.get_both_vfo_freq();
                }
                Followup::DelayedTransmitStatus => {
                    let ctrl = self.clone();
                    tokio::spawn(async move {
                        sleep(TUNE_RECHECK_DELAY).await;
                        let _ = ctrl.get_transmit_status();
                    });
                }
            }
        }
        forward
    }

    /// A bare ACK/NAK answers the most recently sent in-flight set
    /// command; the radio echoes nothing else to correlate on.
    fn decode_ack(&self, st: &mut CivState, cmd: u8) -> bool {
        let newest = st
            .pending
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    *id,
                    SlotId::SetPwr
                        | SlotId::SetRfGain
                        | SlotId::SetSql
                        | SlotId::SetNr
                        | SlotId::SetMainVfoFreq
                        | SlotId::SetSubVfoFreq
                        | SlotId::SetMode
                        | SlotId::SetSubVfoMode
                        | SlotId::SetPtt
                        | SlotId::SetTune
                        | SlotId::SetDataMode
                        | SlotId::SetPreamp
                        | SlotId::SetAgc
                        | SlotId::SetNrEnabled
                        | SlotId::SetTuningStep
                        | SlotId::SetVfo
                        | SlotId::SetSplit
                )
            })
            .max_by_key(|id| st.slots.get(id).map(|s| s.sent_at));
        match newest {
            Some(slot) => {
                if cmd == NAK {
                    debug!(slot = slot.name(), "radio rejected command");
                }
                st.clear_pending(slot);
                false
            }
            None => true,
        }
    }

    fn decode_freq(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.len() < 2 {
            return !st.is_pending(SlotId::GetFreq) && !st.is_pending(SlotId::SetMainVfoFreq);
        }
        st.freq = bcd::bcd_to_freq(d);
        st.relocate_band(st.freq);
        events.push(RadioEvent::FrequencyChanged { freq_hz: st.freq });

        if st.clear_pending(SlotId::GetFreq) {
            return false;
        }
        if st.clear_pending(SlotId::SetMainVfoFreq) {
            return false;
        }
        true
    }

    fn decode_mode(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.is_empty() {
            return !st.is_pending(SlotId::SetMode);
        }
        if let Some(mode) = Mode::from_code(d[0]) {
            st.mode = mode;
        }
        if d.len() > 1 {
            st.filter = Filter::from_code(d[1]);
        }
        events.push(RadioEvent::ModeChanged {
            mode: st.mode,
            data: st.data_mode,
            filter: st.filter,
        });

        if st.clear_pending(SlotId::SetMode) {
            return false;
        }
        if st.clear_pending(SlotId::GetMode) {
            return false;
        }
        true
    }

    fn decode_vfo(&self, st: &mut CivState, d: &[u8], followups: &mut Vec<Followup>) -> bool {
        if d.is_empty() {
            return !st.is_pending(SlotId::SetVfo);
        }
        st.vfo_b_active = d[0] == 1;

        if st.is_pending(SlotId::SetVfo) {
            // The radio does not send frequencies on a VFO switch.
            followups.push(Followup::GetBothVfoFreq);
            st.clear_pending(SlotId::SetVfo);
            return false;
        }
        true
    }

    fn decode_split(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.is_empty() {
            return !st.is_pending(SlotId::GetSplit) && !st.is_pending(SlotId::SetSplit);
        }
        st.split = SplitMode::from_code(d[0]);
        events.push(RadioEvent::SplitChanged(st.split));

        if st.clear_pending(SlotId::GetSplit) {
            return false;
        }
        if st.clear_pending(SlotId::SetSplit) {
            return false;
        }
        true
    }

    fn decode_tuning_step(
        &self,
        st: &mut CivState,
        d: &[u8],
        events: &mut Vec<RadioEvent>,
    ) -> bool {
        if d.is_empty() {
            return !st.is_pending(SlotId::GetTuningStep) && !st.is_pending(SlotId::SetTuningStep);
        }
        st.tuning_step = TuningStep::from_code(d[0]);
        events.push(RadioEvent::TuningStepChanged {
            step_hz: st.tuning_step.hz(),
        });

        if st.clear_pending(SlotId::GetTuningStep) {
            return false;
        }
        if st.clear_pending(SlotId::SetTuningStep) {
            return false;
        }
        true
    }

    /// Command 0x14: RF gain, squelch, NR level, and RF power share an
    /// opcode and are told apart by the sub-command byte. Responses are
    /// sub-command plus a two-byte level.
    fn decode_levels(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.is_empty() {
            return true;
        }
        let sub = d[0];
        let data = &d[1..];
        let (get, set) = match sub {
            0x02 => (SlotId::GetRfGain, SlotId::SetRfGain),
            0x03 => (SlotId::GetSql, SlotId::SetSql),
            0x06 => (SlotId::GetNr, SlotId::SetNr),
            0x0A => (SlotId::GetPwr, SlotId::SetPwr),
            // AF level, PBT, CW pitch, mic gain, and friends: not
            // mirrored here.
            _ => return true,
        };
        if data.len() < 2 {
            return !st.is_pending(get) && !st.is_pending(set);
        }
        let level = bcd::decode_level(data).min(255) as u8;
        match sub {
            0x02 => {
                st.rf_gain = level;
                events.push(RadioEvent::RfGainChanged(level));
            }
            0x03 => {
                st.sql = level;
                events.push(RadioEvent::SquelchChanged(level));
            }
            0x06 => {
                st.nr_level = level;
                events.push(RadioEvent::NrChanged {
                    enabled: st.nr_enabled,
                    level,
                });
            }
            _ => {
                st.pwr = level;
                events.push(RadioEvent::PowerChanged(level));
            }
        }

        if st.clear_pending(get) {
            return false;
        }
        if st.clear_pending(set) {
            return false;
        }
        true
    }

    /// Command 0x15: S-meter, SWR, and drain voltage readings.
    fn decode_meters(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.is_empty() {
            return true;
        }
        let sub = d[0];
        let data = &d[1..];
        match sub {
            0x02 => {
                if data.len() < 2 {
                    return !st.is_pending(SlotId::GetS);
                }
                let level = bcd::s_level(bcd::decode_level(data));
                st.last_s_at = Instant::now();
                events.push(RadioEvent::SMeter {
                    level,
                    label: bcd::s_label(level),
                });
                if st.clear_pending(SlotId::GetS) {
                    return false;
                }
            }
            0x12 => {
                if data.len() < 2 {
                    return !st.is_pending(SlotId::GetSwr);
                }
                st.last_swr_at = Instant::now();
                events.push(RadioEvent::Swr {
                    swr: bcd::swr_from_raw(bcd::decode_level(data)),
                });
                if st.clear_pending(SlotId::GetSwr) {
                    return false;
                }
            }
            0x15 => {
                if data.len() < 2 {
                    return !st.is_pending(SlotId::GetVd);
                }
                events.push(RadioEvent::Vd {
                    volts: bcd::vd_from_raw(bcd::decode_level(data)),
                });
                if st.clear_pending(SlotId::GetVd) {
                    return false;
                }
            }
            _ => {}
        }
        true
    }

    /// Command 0x16: preamp, AGC, and NR enable.
    fn decode_preamp_agc_nr(
        &self,
        st: &mut CivState,
        d: &[u8],
        events: &mut Vec<RadioEvent>,
    ) -> bool {
        if d.is_empty() {
            return true;
        }
        let sub = d[0];
        let data = &d[1..];
        match sub {
            0x02 => {
                if data.is_empty() {
                    return !st.is_pending(SlotId::GetPreamp) && !st.is_pending(SlotId::SetPreamp);
                }
                st.preamp = PreampLevel::from_code(data[0]);
                events.push(RadioEvent::PreampChanged(st.preamp.code()));
                if st.clear_pending(SlotId::GetPreamp) {
                    return false;
                }
                if st.clear_pending(SlotId::SetPreamp) {
                    return false;
                }
            }
            0x12 => {
                if data.is_empty() {
                    return !st.is_pending(SlotId::GetAgc) && !st.is_pending(SlotId::SetAgc);
                }
                if let Some(agc) = AgcMode::from_code(data[0]) {
                    st.agc = agc;
                    events.push(RadioEvent::AgcChanged(agc));
                }
                if st.clear_pending(SlotId::GetAgc) {
                    return false;
                }
                if st.clear_pending(SlotId::SetAgc) {
                    return false;
                }
            }
            0x40 => {
                if data.is_empty() {
                    return !st.is_pending(SlotId::GetNrEnabled)
                        && !st.is_pending(SlotId::SetNrEnabled);
                }
                st.nr_enabled = data[0] == 1;
                events.push(RadioEvent::NrChanged {
                    enabled: st.nr_enabled,
                    level: st.nr_level,
                });
                if st.clear_pending(SlotId::GetNrEnabled) {
                    return false;
                }
                if st.clear_pending(SlotId::SetNrEnabled) {
                    return false;
                }
            }
            _ => {}
        }
        true
    }

    /// Command 0x1A: data mode (sub 0x06) and overflow (sub 0x09).
    fn decode_data_mode_and_ovf(
        &self,
        st: &mut CivState,
        d: &[u8],
        events: &mut Vec<RadioEvent>,
    ) -> bool {
        if d.is_empty() {
            return true;
        }
        match d[0] {
            0x06 => {
                if d.len() < 3 {
                    return !st.is_pending(SlotId::SetDataMode);
                }
                if d[1] == 1 {
                    st.data_mode = true;
                    st.filter = Filter::from_code(d[2]);
                } else {
                    st.data_mode = false;
                }
                events.push(RadioEvent::ModeChanged {
                    mode: st.mode,
                    data: st.data_mode,
                    filter: st.filter,
                });
                if st.clear_pending(SlotId::SetDataMode) {
                    return false;
                }
            }
            0x09 => {
                if d.len() < 2 {
                    return !st.is_pending(SlotId::GetOvf);
                }
                st.last_ovf_at = Instant::now();
                events.push(RadioEvent::Ovf(d[1] != 0));
                if st.clear_pending(SlotId::GetOvf) {
                    return false;
                }
            }
            _ => {}
        }
        true
    }

    /// Command 0x1C: PTT (sub 0x00) and tuner (sub 0x01) status.
    fn decode_transmit_status(
        &self,
        st: &mut CivState,
        d: &[u8],
        events: &mut Vec<RadioEvent>,
        followups: &mut Vec<Followup>,
    ) -> bool {
        if d.len() < 2 {
            return !st.is_pending(SlotId::GetTuneStatus)
                && !st.is_pending(SlotId::GetTransmitStatus)
                && !st.is_pending(SlotId::SetPtt);
        }

        match d[0] {
            0x00 => {
                if d[1] == 1 {
                    st.ptt = true;
                } else if st.ptt {
                    // PTT released.
                    st.ptt = false;
                    if let Some(timer) = st.ptt_timer.take() {
                        timer.abort();
                    }
                    followups.push(Followup::GetVd);
                }
                events.push(RadioEvent::PttChanged {
                    ptt: st.ptt,
                    tune: st.tune,
                });
                if st.clear_pending(SlotId::SetPtt) {
                    return false;
                }
            }
            0x01 => {
                if d[1] == 2 {
                    st.tune = true;
                    // The radio never reports tune-finished on its own.
                    followups.push(Followup::DelayedTransmitStatus);
                } else if st.tune {
                    // Tune finished.
                    st.tune = false;
                    if let Some(timer) = st.tune_timer.take() {
                        timer.abort();
                    }
                    followups.push(Followup::GetVd);
                }
                events.push(RadioEvent::PttChanged {
                    ptt: st.ptt,
                    tune: st.tune,
                });
                if st.clear_pending(SlotId::SetTune) {
                    return false;
                }
            }
            _ => {}
        }

        if st.clear_pending(SlotId::GetTuneStatus) {
            return false;
        }
        if st.clear_pending(SlotId::GetTransmitStatus) {
            return false;
        }
        true
    }

    /// Command 0x25: per-VFO frequency (sub selects main or sub VFO).
    fn decode_vfo_freq(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.len() < 2 {
            return !st.is_pending(SlotId::GetMainVfoFreq)
                && !st.is_pending(SlotId::GetSubVfoFreq)
                && !st.is_pending(SlotId::SetSubVfoFreq);
        }
        let freq = bcd::bcd_to_freq(&d[1..]);
        match d[0] {
            0x01 => {
                st.sub_freq = freq;
                events.push(RadioEvent::SubFrequencyChanged { freq_hz: freq });
                if st.clear_pending(SlotId::GetSubVfoFreq) {
                    return false;
                }
                if st.clear_pending(SlotId::SetSubVfoFreq) {
                    return false;
                }
            }
            _ => {
                st.freq = freq;
                st.relocate_band(freq);
                st.last_vfo_freq_at = Instant::now();
                events.push(RadioEvent::FrequencyChanged { freq_hz: freq });
                if st.clear_pending(SlotId::GetMainVfoFreq) {
                    return false;
                }
                if st.clear_pending(SlotId::SetMainVfoFreq) {
                    return false;
                }
            }
        }
        true
    }

    /// Command 0x26: per-VFO mode, data flag, and filter.
    fn decode_vfo_mode(&self, st: &mut CivState, d: &[u8], events: &mut Vec<RadioEvent>) -> bool {
        if d.len() < 2 {
            return !st.is_pending(SlotId::GetMainVfoMode)
                && !st.is_pending(SlotId::GetSubVfoMode)
                && !st.is_pending(SlotId::SetSubVfoMode);
        }
        let mode = Mode::from_code(d[1]);
        let data_mode = d.len() > 2 && d[2] != 0;
        let filter = if d.len() > 3 {
            Some(Filter::from_code(d[3]))
        } else {
            None
        };

        match d[0] {
            0x01 => {
                if let Some(mode) = mode {
                    st.sub_mode = mode;
                }
                st.sub_data_mode = data_mode;
                if let Some(f) = filter {
                    st.sub_filter = f;
                }
                events.push(RadioEvent::SubModeChanged {
                    mode: st.sub_mode,
                    data: st.sub_data_mode,
                    filter: st.sub_filter,
                });
                if st.clear_pending(SlotId::GetSubVfoMode) {
                    return false;
                }
                if st.clear_pending(SlotId::SetSubVfoMode) {
                    return false;
                }
            }
            _ => {
                if let Some(mode) = mode {
                    st.mode = mode;
                }
                st.data_mode = data_mode;
                if let Some(f) = filter {
                    st.filter = f;
                }
                events.push(RadioEvent::ModeChanged {
                    mode: st.mode,
                    data: st.data_mode,
                    filter: st.filter,
                });
                if st.clear_pending(SlotId::GetMainVfoMode) {
                    return false;
                }
            }
        }
        true
    }

    // -----------------------------------------------------------------
    // Background retry/poll loop
    // -----------------------------------------------------------------

    async fn run_loop(&self) {
        let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; the initial
        // poll already ran in start().
        poll.tick().await;

        loop {
            let next_retry = {
                let st = self.lock();
                st.pending
                    .iter()
                    .filter_map(|id| st.slots.get(id))
                    .map(|slot| slot.sent_at + COMMAND_RETRY_TIMEOUT)
                    .min()
            };
            let retry_at =
                next_retry.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.inner.shutdown.notified() => {
                    debug!("civ loop shutting down");
                    return;
                }
                _ = self.inner.wake.notified() => {
                    // New pending command: recompute the retry deadline.
                }
                _ = poll.tick() => {
                    self.poll_status();
                }
                _ = sleep_until(retry_at) => {
                    self.resend_overdue();
                }
            }
        }
    }

    /// One status-poll tick: SWR while transmitting or tuning,
    /// S-meter and OVF otherwise, VFO frequencies always. Each request
    /// is suppressed while one is already in flight or a reading is
    /// fresh.
    fn poll_status(&self) {
        let now = Instant::now();
        let (want_swr, want_s, want_ovf, want_vfo) = {
            let st = self.lock();
            let transmitting = st.ptt || st.tune;
            (
                transmitting
                    && !st.is_pending(SlotId::GetSwr)
                    && now.duration_since(st.last_swr_at) >= STATUS_POLL_INTERVAL,
                !transmitting
                    && !st.is_pending(SlotId::GetS)
                    && now.duration_since(st.last_s_at) >= STATUS_POLL_INTERVAL,
                !transmitting
                    && !st.is_pending(SlotId::GetOvf)
                    && now.duration_since(st.last_ovf_at) >= STATUS_POLL_INTERVAL,
                !st.is_pending(SlotId::GetMainVfoFreq)
                    && !st.is_pending(SlotId::GetSubVfoFreq)
                    && now.duration_since(st.last_vfo_freq_at) >= STATUS_POLL_INTERVAL,
            )
        };

        if want_swr {
            let _ = self.get_swr();
        }
        if want_s {
            let _ = self.get_s();
        }
        if want_ovf {
            let _ = self.get_ovf();
        }
        if want_vfo {
            let _ = self.get_both_vfo_freq();
        }
    }

    /// Resend every pending command older than the retry timeout with
    /// a fresh send time. No retry cap: a slot keeps retrying until
    /// its response arrives or the stream fails.
    fn resend_overdue(&self) {
        let now = Instant::now();
        let overdue: Vec<(SlotId, Vec<u8>)> = {
            let mut st = self.lock();
            let ids: Vec<SlotId> = st.pending.clone();
            ids.iter()
                .filter_map(|id| {
                    let slot = st.slots.get_mut(id)?;
                    if now.duration_since(slot.sent_at) >= COMMAND_RETRY_TIMEOUT {
                        slot.sent_at = now;
                        Some((*id, slot.bytes.clone()))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (id, bytes) in overdue {
            trace!(slot = id.name(), "retrying command");
            let _ = self.transmit(bytes);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::civ::encode_packet;

    const RADIO: u8 = 0xA4;
    const CTL: u8 = 0xE0;

    fn controller() -> (
        CivController,
        mpsc::UnboundedReceiver<Vec<u8>>,
        broadcast::Receiver<RadioEvent>,
    ) {
        let (serial_tx, serial_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = broadcast::channel(256);
        let opts = ControllerOptions {
            civ_address: RADIO,
            controller_address: CTL,
            set_data_mode_on_tx: false,
            debug_packets: false,
        };
        (
            CivController::new(opts, serial_tx, events_tx),
            serial_rx,
            events_rx,
        )
    }

    /// A response packet from the radio to the controller.
    fn from_radio(body: &[u8]) -> Vec<u8> {
        encode_packet(CTL, RADIO, body)
    }

    fn ack() -> Vec<u8> {
        from_radio(&[ACK])
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(pkt) = rx.try_recv() {
            out.push(pkt);
        }
        out
    }

    #[tokio::test]
    async fn set_main_vfo_freq_wire_bytes() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_main_vfo_freq(14_250_000).unwrap();
        let pkt = serial_rx.try_recv().unwrap();
        assert_eq!(
            pkt,
            vec![0xFE, 0xFE, 0xA4, 0xE0, 0x25, 0x00, 0x00, 0x50, 0x25, 0x14, 0x00, 0xFD]
        );
        assert_eq!(ctrl.pending_slots(), vec![SlotId::SetMainVfoFreq]);

        // The radio's bare ACK clears the pending slot and is claimed.
        assert!(!ctrl.handle_packet(&ack()));
        assert!(ctrl.pending_slots().is_empty());
        assert!(ctrl.pending_invariant_holds());
    }

    #[tokio::test]
    async fn freq_response_updates_mirror_and_band() {
        let (ctrl, _serial_rx, mut events) = controller();
        ctrl.get_freq().unwrap();

        let mut body = vec![0x03];
        body.extend_from_slice(&bcd::freq_to_bcd(14_200_000));
        assert!(!ctrl.handle_packet(&from_radio(&body)), "claimed response");

        let st = ctrl.state();
        assert_eq!(st.freq, 14_200_000);
        assert_eq!(st.band, Band::Band20m);
        assert!(matches!(
            events.try_recv().unwrap(),
            RadioEvent::FrequencyChanged {
                freq_hz: 14_200_000
            }
        ));
    }

    #[tokio::test]
    async fn unsolicited_freq_is_forwarded() {
        let (ctrl, _serial_rx, _events) = controller();
        let mut body = vec![0x00];
        body.extend_from_slice(&bcd::freq_to_bcd(7_074_000));
        // Nothing pending: a transceive broadcast stays visible to
        // external serial consumers.
        assert!(ctrl.handle_packet(&from_radio(&body)));
        assert_eq!(ctrl.state().freq, 7_074_000);
    }

    #[tokio::test]
    async fn short_packet_leaves_pending_slot() {
        let (ctrl, _serial_rx, _events) = controller();
        ctrl.get_freq().unwrap();
        // Truncated frequency response: skip decoding, keep pending.
        assert!(!ctrl.handle_packet(&from_radio(&[0x03])));
        assert_eq!(ctrl.pending_slots(), vec![SlotId::GetFreq]);
        assert!(ctrl.pending_invariant_holds());
    }

    #[tokio::test]
    async fn malformed_packet_is_forwarded_untouched() {
        let (ctrl, _serial_rx, _events) = controller();
        assert!(ctrl.handle_packet(&[0xFE, 0xFE, 0xE0]));
        assert!(ctrl.handle_packet(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]));
    }

    #[tokio::test]
    async fn pending_invariant_across_operations() {
        let (ctrl, _serial_rx, _events) = controller();
        ctrl.get_s().unwrap();
        assert!(ctrl.pending_invariant_holds());
        // Reissue while pending: still one entry.
        ctrl.get_s().unwrap();
        assert!(ctrl.pending_invariant_holds());
        assert_eq!(ctrl.pending_slots(), vec![SlotId::GetS]);

        ctrl.get_swr().unwrap();
        ctrl.set_pwr(100).unwrap();
        assert!(ctrl.pending_invariant_holds());
        assert_eq!(ctrl.pending_slots().len(), 3);

        // S-meter response clears only get_s.
        let mut body = vec![0x15, 0x02];
        body.extend_from_slice(&bcd::encode_level(120));
        assert!(!ctrl.handle_packet(&from_radio(&body)));
        assert!(ctrl.pending_invariant_holds());
        assert_eq!(ctrl.pending_slots().len(), 2);
    }

    #[tokio::test]
    async fn s_meter_event_has_label() {
        let (ctrl, _serial_rx, mut events) = controller();
        ctrl.get_s().unwrap();
        let mut body = vec![0x15, 0x02];
        body.extend_from_slice(&bcd::encode_level(120));
        ctrl.handle_packet(&from_radio(&body));
        match events.try_recv().unwrap() {
            RadioEvent::SMeter { level, label } => {
                assert_eq!(level, 9);
                assert_eq!(label, "S9");
            }
            other => panic!("expected SMeter, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pending_command_retries_identically() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.start().unwrap();
        let initial = drain(&mut serial_rx);
        let get_s = vec![0xFE, 0xFE, 0xA4, 0xE0, 0x15, 0x02, 0xFD];
        assert!(initial.contains(&get_s), "init poll includes get_s");

        // No response to anything: after the retry timeout every
        // pending command is resent with identical bytes.
        tokio::time::advance(COMMAND_RETRY_TIMEOUT + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        let resent = drain(&mut serial_rx);
        assert!(resent.contains(&get_s), "get_s resent identically");

        ctrl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn response_stops_retries() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.get_s().unwrap();
        ctrl.start().unwrap();
        drain(&mut serial_rx);

        let mut body = vec![0x15, 0x02];
        body.extend_from_slice(&bcd::encode_level(60));
        ctrl.handle_packet(&from_radio(&body));

        // get_s answered; only other init-poll slots retry. (Stay
        // under the 1 s poll tick so the poller does not re-issue it.)
        tokio::time::advance(COMMAND_RETRY_TIMEOUT + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        let resent = drain(&mut serial_rx);
        let get_s = vec![0xFE, 0xFE, 0xA4, 0xE0, 0x15, 0x02, 0xFD];
        assert!(!resent.contains(&get_s), "answered slot must not retry");

        ctrl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ptt_timeout_forces_off() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_ptt(true).unwrap();
        let keyed = serial_rx.try_recv().unwrap();
        assert_eq!(keyed, vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x00, 0x01, 0xFD]);

        // Radio confirms TX.
        assert!(!ctrl.handle_packet(&ack()));
        ctrl.handle_packet(&from_radio(&[0x1C, 0x00, 0x01]));
        assert!(ctrl.state().ptt);

        // Ten minutes later the timer forces PTT off.
        tokio::time::advance(PTT_TIMEOUT + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        let sent = drain(&mut serial_rx);
        assert!(
            sent.contains(&vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x00, 0x00, 0xFD]),
            "timer must dispatch set_ptt(off), got {sent:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ptt_release_cancels_timer() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_ptt(true).unwrap();
        ctrl.handle_packet(&from_radio(&[0x1C, 0x00, 0x01]));
        drain(&mut serial_rx);

        // Radio reports RX again: timer stops, Vd is re-read.
        ctrl.handle_packet(&from_radio(&[0x1C, 0x00, 0x00]));
        assert!(!ctrl.state().ptt);
        let sent = drain(&mut serial_rx);
        assert!(
            sent.contains(&vec![0xFE, 0xFE, 0xA4, 0xE0, 0x15, 0x15, 0xFD]),
            "PTT release re-reads Vd"
        );

        // Long after, no forced unkey appears.
        tokio::time::advance(PTT_TIMEOUT * 2).await;
        tokio::task::yield_now().await;
        let later = drain(&mut serial_rx);
        assert!(
            !later.contains(&vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x00, 0x00, 0xFD]),
            "cancelled timer must not fire"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tune_timeout_forces_off() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_tune(true).unwrap();
        let pkt = serial_rx.try_recv().unwrap();
        assert_eq!(pkt, vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x01, 0x02, 0xFD]);

        ctrl.handle_packet(&from_radio(&[0x1C, 0x01, 0x02]));
        assert!(ctrl.state().tune);
        drain(&mut serial_rx);

        tokio::time::advance(TUNE_TIMEOUT + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        let sent = drain(&mut serial_rx);
        // Tune-off carries 1, as the original controller sends.
        assert!(
            sent.contains(&vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x01, 0x01, 0xFD]),
            "timer must dispatch set_tune(off), got {sent:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tune_start_queues_delayed_status_poll() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_tune(true).unwrap();
        ctrl.handle_packet(&from_radio(&[0x1C, 0x01, 0x02]));
        drain(&mut serial_rx);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;
        let sent = drain(&mut serial_rx);
        assert!(
            sent.contains(&vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x00, 0xFD]),
            "transmit status re-polled after tune start, got {sent:?}"
        );
    }

    #[tokio::test]
    async fn tune_ignored_while_transmitting() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.handle_packet(&from_radio(&[0x1C, 0x00, 0x01]));
        assert!(ctrl.state().ptt);
        ctrl.set_tune(true).unwrap();
        assert!(drain(&mut serial_rx).is_empty(), "tune during TX is a no-op");
    }

    #[tokio::test]
    async fn band_step_uses_memory_or_midpoint() {
        let (ctrl, mut serial_rx, _events) = controller();

        // Park on 20 m.
        let mut body = vec![0x25, 0x00];
        body.extend_from_slice(&bcd::freq_to_bcd(14_200_000));
        ctrl.handle_packet(&from_radio(&body));
        assert_eq!(ctrl.state().band, Band::Band20m);
        drain(&mut serial_rx);

        // 17 m has never been visited: band-up goes to its midpoint.
        ctrl.inc_band().unwrap();
        let pkt = serial_rx.try_recv().unwrap();
        let mut expect = vec![0xFE, 0xFE, 0xA4, 0xE0, 0x25, 0x00];
        expect.extend_from_slice(&bcd::freq_to_bcd(18_118_000));
        expect.push(0xFD);
        assert_eq!(pkt, expect);

        // The radio follows; 17 m is now remembered.
        let mut body = vec![0x25, 0x00];
        body.extend_from_slice(&bcd::freq_to_bcd(18_100_000));
        ctrl.handle_packet(&from_radio(&body));

        // Band-down returns to the remembered 20 m frequency.
        ctrl.dec_band().unwrap();
        let pkt = serial_rx.try_recv().unwrap();
        let mut expect = vec![0xFE, 0xFE, 0xA4, 0xE0, 0x25, 0x00];
        expect.extend_from_slice(&bcd::freq_to_bcd(14_200_000));
        expect.push(0xFD);
        assert_eq!(pkt, expect);
    }

    #[tokio::test]
    async fn vfo_switch_triggers_frequency_reread() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_vfo(true).unwrap();
        drain(&mut serial_rx);

        // Radio confirms the VFO switch.
        assert!(!ctrl.handle_packet(&from_radio(&[0x07, 0x01])));
        assert!(ctrl.state().vfo_b_active);
        let sent = drain(&mut serial_rx);
        assert!(
            sent.contains(&vec![0xFE, 0xFE, 0xA4, 0xE0, 0x25, 0x00, 0xFD]),
            "VFO switch re-reads frequencies"
        );
    }

    #[tokio::test]
    async fn set_nr_enables_nr_first() {
        let (ctrl, mut serial_rx, _events) = controller();
        ctrl.set_nr(128).unwrap();
        let sent = drain(&mut serial_rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], vec![0xFE, 0xFE, 0xA4, 0xE0, 0x16, 0x40, 0x01, 0xFD]);
        assert_eq!(sent[1][..7], [0xFE, 0xFE, 0xA4, 0xE0, 0x14, 0x06, 0x01]);
    }

    #[tokio::test]
    async fn set_data_mode_on_tx_keys_data_first() {
        let (serial_tx, mut serial_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = broadcast::channel(16);
        let ctrl = CivController::new(
            ControllerOptions {
                civ_address: RADIO,
                controller_address: CTL,
                set_data_mode_on_tx: true,
                debug_packets: false,
            },
            serial_tx,
            events_tx,
        );
        ctrl.set_ptt(true).unwrap();
        let sent = drain(&mut serial_rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1A, 0x06, 0x01, 0x01, 0xFD]
        );
        assert_eq!(
            sent[1],
            vec![0xFE, 0xFE, 0xA4, 0xE0, 0x1C, 0x00, 0x01, 0xFD]
        );
    }

    #[tokio::test]
    async fn split_cycle_and_decode() {
        let (ctrl, mut serial_rx, mut events) = controller();
        ctrl.toggle_split().unwrap();
        let pkt = serial_rx.try_recv().unwrap();
        assert_eq!(pkt, vec![0xFE, 0xFE, 0xA4, 0xE0, 0x0F, 0x01, 0xFD]);

        assert!(!ctrl.handle_packet(&from_radio(&[0x0F, 0x01])));
        assert_eq!(ctrl.state().split, SplitMode::On);
        assert!(matches!(
            events.try_recv().unwrap(),
            RadioEvent::SplitChanged(SplitMode::On)
        ));
    }

    #[tokio::test]
    async fn mode_decode_via_vfo_mode() {
        let (ctrl, _serial_rx, mut events) = controller();
        ctrl.get_both_vfo_mode().unwrap();

        // Main VFO: USB, data on, FIL2.
        assert!(!ctrl.handle_packet(&from_radio(&[0x26, 0x00, 0x01, 0x01, 0x02])));
        let st = ctrl.state();
        assert_eq!(st.mode, Mode::USB);
        assert!(st.data_mode);
        assert_eq!(st.filter, Filter::Fil2);
        assert!(matches!(
            events.try_recv().unwrap(),
            RadioEvent::ModeChanged {
                mode: Mode::USB,
                data: true,
                filter: Filter::Fil2
            }
        ));

        // Sub VFO: CW, no data, FIL3.
        assert!(!ctrl.handle_packet(&from_radio(&[0x26, 0x01, 0x03, 0x00, 0x03])));
        let st = ctrl.state();
        assert_eq!(st.sub_mode, Mode::CW);
        assert!(!st.sub_data_mode);
        assert_eq!(st.sub_filter, Filter::Fil3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_acknowledges_loop_exit() {
        let (ctrl, _serial_rx, _events) = controller();
        ctrl.start().unwrap();
        ctrl.shutdown().await;
        // A second shutdown is harmless.
        ctrl.shutdown().await;
    }
}
