use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{error, info, warn};

use crate::codec::{LogReader, LogWriter};
use crate::control::RrControl;
use crate::entry::{Callsite, Entry, EntryVariant, SkippedCall};
use crate::error::RrError;
use crate::prog_point::{PointRelation, ProgPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RrMode {
    #[default]
    Off,
    Record,
    Replay,
}

/// The slice of the emulator the replay of skipped calls needs: the
/// guest-visible effects of device emulation.
pub trait PhysicalMemory {
    fn phys_mem_write(&mut self, addr: u32, buf: &[u8]);
    fn register_mem_region(&mut self, start_addr: u32, size: u64, phys_offset: u64);
}

/// The record/replay state machine.
///
/// Owned by the emulator thread. In record mode every non-deterministic
/// call site appends one entry at the current program point; in replay
/// mode the same call sites pull entries back out, strictly in program
/// point order, and a call site that runs past an unconsumed entry is a
/// fatal divergence.
pub struct RrEngine {
    mode: RrMode,
    prog_point: ProgPoint,
    /// Countdown used to cut translation blocks short so an interrupt
    /// can be delivered at the exact recorded instruction.
    num_instr_before_next_interrupt: i64,
    /// Call site of the non-deterministic action currently executing.
    callsite: Callsite,
    /// Latch refusing nested recording: only the outermost frame of a
    /// nested emulation call records one composite entry.
    record_in_progress: bool,
    please_flush_tb: bool,
    writer: Option<LogWriter<BufWriter<File>>>,
    reader: Option<LogReader<BufReader<File>>>,
}

impl Default for RrEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RrEngine {
    pub fn new() -> RrEngine {
        RrEngine {
            mode: RrMode::Off,
            prog_point: ProgPoint::default(),
            num_instr_before_next_interrupt: 0,
            callsite: Callsite::MAIN_LOOP,
            record_in_progress: false,
            please_flush_tb: false,
            writer: None,
            reader: None,
        }
    }

    pub fn mode(&self) -> RrMode {
        self.mode
    }

    pub fn is_recording(&self) -> bool {
        self.mode == RrMode::Record
    }

    pub fn is_replaying(&self) -> bool {
        self.mode == RrMode::Replay
    }

    pub fn is_off(&self) -> bool {
        self.mode == RrMode::Off
    }

    pub fn prog_point(&self) -> ProgPoint {
        self.prog_point
    }

    /// Moves the program point, keeping the interrupt countdown in step
    /// with the retired-instruction delta.
    pub fn set_prog_point(&mut self, point: ProgPoint) {
        let delta = point.instr_count.wrapping_sub(self.prog_point.instr_count) as i64;
        self.num_instr_before_next_interrupt -= delta;
        self.prog_point = point;
    }

    pub fn num_instr_before_next_interrupt(&self) -> i64 {
        self.num_instr_before_next_interrupt
    }

    pub fn set_num_instr_before_next_interrupt(&mut self, n: i64) {
        self.num_instr_before_next_interrupt = n;
    }

    pub fn set_callsite(&mut self, callsite: Callsite) {
        self.callsite = callsite;
    }

    pub fn callsite(&self) -> Callsite {
        self.callsite
    }

    // Translation-block cache flushing, requested around mode changes so
    // stale uninstrumented code cannot run.

    pub fn request_tb_flush(&mut self) {
        self.please_flush_tb = true;
    }

    pub fn tb_flush_done(&mut self) {
        self.please_flush_tb = false;
    }

    pub fn wants_tb_flush(&self) -> bool {
        self.please_flush_tb
    }

    // Session management. Called from the emulator loop between
    // translation blocks, never mid-instruction.

    pub fn begin_record_to(&mut self, path: &Path) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => return Err(RrError::RecordInProgress),
            RrMode::Replay => return Err(RrError::ReplayInProgress),
            RrMode::Off => {}
        }
        let file = File::create(path)?;
        self.writer = Some(LogWriter::new(BufWriter::new(file)));
        self.mode = RrMode::Record;
        self.request_tb_flush();
        info!("recording to {}", path.display());
        Ok(())
    }

    pub fn end_record(&mut self) -> Result<(), RrError> {
        if self.mode != RrMode::Record {
            return Err(RrError::NotActive);
        }
        let writer = self.writer.take().ok_or(RrError::NotActive)?;
        let entries = writer.entries_written();
        writer.finish(self.prog_point)?;
        self.mode = RrMode::Off;
        self.record_in_progress = false;
        self.request_tb_flush();
        info!(
            "recording ended at {} with {} entries",
            self.prog_point, entries
        );
        Ok(())
    }

    pub fn begin_replay_from(&mut self, path: &Path) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => return Err(RrError::RecordInProgress),
            RrMode::Replay => return Err(RrError::ReplayInProgress),
            RrMode::Off => {}
        }
        let file = File::open(path)?;
        self.reader = Some(LogReader::new(BufReader::new(file)));
        self.mode = RrMode::Replay;
        self.request_tb_flush();
        info!("replaying from {}", path.display());
        Ok(())
    }

    pub fn end_replay(&mut self, is_error: bool) -> Result<(), RrError> {
        if self.mode != RrMode::Replay {
            return Err(RrError::NotActive);
        }
        let reader = self.reader.take().ok_or(RrError::NotActive)?;
        self.mode = RrMode::Off;
        self.request_tb_flush();
        if is_error {
            warn!(
                "replay aborted at {} after {} entries",
                self.prog_point,
                reader.entries_read()
            );
        } else {
            info!(
                "replay ended at {} after {} entries",
                self.prog_point,
                reader.entries_read()
            );
        }
        Ok(())
    }

    /// True once the whole log has been consumed.
    pub fn replay_finished(&mut self) -> bool {
        match self.reader.as_mut() {
            Some(reader) => matches!(reader.peek(), Ok(None)),
            None => false,
        }
    }

    pub fn replay_progress(&self) {
        if let Some(reader) = &self.reader {
            info!(
                "replay progress: {} entries consumed, at {}",
                reader.entries_read(),
                self.prog_point
            );
        }
    }

    /// Services the monitor's request flags. The emulator loop calls this
    /// between translation blocks.
    pub fn service_requests(&mut self, control: &RrControl) -> Result<(), RrError> {
        if let Some(name) = control.take_record_request() {
            if let Err(e) = self.begin_record_to(&name) {
                warn!("refusing record request: {e}");
            }
        }
        if control.take_end_record_request() {
            if let Err(e) = self.end_record() {
                warn!("refusing end-record request: {e}");
            }
        }
        if let Some(name) = control.take_replay_request() {
            if let Err(e) = self.begin_replay_from(&name) {
                warn!("refusing replay request: {e}");
            }
        }
        if let Some(is_error) = control.take_end_replay_request() {
            if let Err(e) = self.end_replay(is_error) {
                warn!("refusing end-replay request: {e}");
            }
        }
        Ok(())
    }

    // Recording. One entry per call, at the current program point.

    fn record(&mut self, variant: EntryVariant) -> Result<(), RrError> {
        let writer = self.writer.as_mut().ok_or(RrError::NotActive)?;
        writer.write_entry(&Entry {
            prog_point: self.prog_point,
            callsite: self.callsite,
            variant,
        })
    }

    pub fn record_input_1(&mut self, data: u8) -> Result<(), RrError> {
        self.record(EntryVariant::Input1(data))
    }

    pub fn record_input_2(&mut self, data: u16) -> Result<(), RrError> {
        self.record(EntryVariant::Input2(data))
    }

    pub fn record_input_4(&mut self, data: u32) -> Result<(), RrError> {
        self.record(EntryVariant::Input4(data))
    }

    pub fn record_input_8(&mut self, data: u64) -> Result<(), RrError> {
        self.record(EntryVariant::Input8(data))
    }

    pub fn record_interrupt_request(&mut self, request: u16) -> Result<(), RrError> {
        self.record(EntryVariant::InterruptRequest(request))
    }

    pub fn record_mem_rw(
        &mut self,
        addr: u32,
        buf: &[u8],
        is_write: bool,
    ) -> Result<(), RrError> {
        self.record(EntryVariant::SkippedCall(SkippedCall::MemRw {
            addr,
            len: buf.len() as u32,
            buf: if is_write { buf.to_vec() } else { Vec::new() },
            is_write,
        }))
    }

    pub fn record_reg_mem_region(
        &mut self,
        start_addr: u32,
        size: u64,
        phys_offset: u64,
    ) -> Result<(), RrError> {
        self.record(EntryVariant::SkippedCall(SkippedCall::RegMemRegion {
            start_addr,
            size,
            phys_offset,
        }))
    }

    // Replay. Each step peeks at the next entry and consumes it only
    // when the live program point has caught up with it.

    fn replay_step<T>(
        &mut self,
        expected: &'static str,
        extract: impl FnOnce(&EntryVariant) -> Option<T>,
    ) -> Result<Option<T>, RrError> {
        let current = self.prog_point;
        let callsite = self.callsite;
        let reader = self.reader.as_mut().ok_or(RrError::NotActive)?;
        let Some(entry) = reader.peek()? else {
            return Ok(None);
        };
        match current.relation_to(&entry.prog_point) {
            PointRelation::NotYet => Ok(None),
            PointRelation::Diverged => {
                let recorded = entry.prog_point;
                error!("disagreement at {recorded}; live execution is at {current}");
                Err(RrError::Divergence { current, recorded })
            }
            PointRelation::Here => {
                let point = entry.prog_point;
                match extract(&entry.variant) {
                    Some(value) => {
                        if entry.callsite != callsite {
                            // the callsite tag is only a sanity check
                            warn!(
                                "callsite mismatch at {point}: recorded {}, live {}",
                                entry.callsite, callsite
                            );
                        }
                        reader.take();
                        Ok(Some(value))
                    }
                    None => Err(RrError::UnexpectedEntry {
                        expected,
                        found: variant_name(&entry.variant),
                        point,
                    }),
                }
            }
        }
    }

    /// Replays a 1-byte input. Returns false (leaving `val` untouched)
    /// when the recorded moment has not been reached yet.
    pub fn replay_input_1(&mut self, val: &mut u8) -> Result<bool, RrError> {
        let got = self.replay_step("INPUT_1", |v| match v {
            EntryVariant::Input1(d) => Some(*d),
            _ => None,
        })?;
        Ok(apply(val, got))
    }

    pub fn replay_input_2(&mut self, val: &mut u16) -> Result<bool, RrError> {
        let got = self.replay_step("INPUT_2", |v| match v {
            EntryVariant::Input2(d) => Some(*d),
            _ => None,
        })?;
        Ok(apply(val, got))
    }

    pub fn replay_input_4(&mut self, val: &mut u32) -> Result<bool, RrError> {
        let got = self.replay_step("INPUT_4", |v| match v {
            EntryVariant::Input4(d) => Some(*d),
            _ => None,
        })?;
        Ok(apply(val, got))
    }

    pub fn replay_input_8(&mut self, val: &mut u64) -> Result<bool, RrError> {
        let got = self.replay_step("INPUT_8", |v| match v {
            EntryVariant::Input8(d) => Some(*d),
            _ => None,
        })?;
        Ok(apply(val, got))
    }

    pub fn replay_interrupt_request(&mut self, request: &mut u16) -> Result<bool, RrError> {
        let got = self.replay_step("INTERRUPT_REQUEST", |v| match v {
            EntryVariant::InterruptRequest(d) => Some(*d),
            _ => None,
        })?;
        Ok(apply(request, got))
    }

    /// Re-applies every skipped emulation call recorded at the current
    /// program point.
    pub fn replay_skipped_calls(
        &mut self,
        mem: &mut dyn PhysicalMemory,
    ) -> Result<(), RrError> {
        loop {
            let due = {
                let current = self.prog_point;
                let reader = self.reader.as_mut().ok_or(RrError::NotActive)?;
                match reader.peek()? {
                    Some(entry)
                        if matches!(entry.variant, EntryVariant::SkippedCall(_))
                            && current.relation_to(&entry.prog_point)
                                == PointRelation::Here =>
                    {
                        reader.take()
                    }
                    _ => None,
                }
            };
            let Some(entry) = due else {
                return Ok(());
            };
            let EntryVariant::SkippedCall(call) = entry.variant else {
                unreachable!("peek guaranteed a skipped call");
            };
            match call {
                SkippedCall::MemRw {
                    addr,
                    buf,
                    is_write,
                    ..
                } => {
                    // a recorded device *read* had no guest-visible effect
                    if is_write {
                        mem.phys_mem_write(addr, &buf);
                    }
                }
                SkippedCall::RegMemRegion {
                    start_addr,
                    size,
                    phys_offset,
                } => mem.register_mem_region(start_addr, size, phys_offset),
            }
        }
    }

    // Tri-mode convenience dispatchers, one per input width; these are
    // what the wrapped call sites actually invoke.

    pub fn input_1(&mut self, val: &mut u8) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => self.record_input_1(*val),
            RrMode::Replay => self.replay_input_1(val).map(drop),
            RrMode::Off => Ok(()),
        }
    }

    pub fn input_2(&mut self, val: &mut u16) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => self.record_input_2(*val),
            RrMode::Replay => self.replay_input_2(val).map(drop),
            RrMode::Off => Ok(()),
        }
    }

    pub fn input_4(&mut self, val: &mut u32) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => self.record_input_4(*val),
            RrMode::Replay => self.replay_input_4(val).map(drop),
            RrMode::Off => Ok(()),
        }
    }

    pub fn input_8(&mut self, val: &mut u64) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => self.record_input_8(*val),
            RrMode::Replay => self.replay_input_8(val).map(drop),
            RrMode::Off => Ok(()),
        }
    }

    pub fn interrupt_request(&mut self, request: &mut u16) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => self.record_interrupt_request(*request),
            RrMode::Replay => self.replay_interrupt_request(request).map(drop),
            RrMode::Off => Ok(()),
        }
    }

    /// Wraps one non-deterministic call site.
    ///
    /// In record mode the latch ensures only the outermost frame of a
    /// nested emulation call logs (the inner frames just run `action`);
    /// in replay mode the due skipped calls are re-applied before the
    /// site's own replay action runs.
    pub fn at_callsite(
        &mut self,
        callsite: Callsite,
        point: ProgPoint,
        mem: &mut dyn PhysicalMemory,
        action: impl FnOnce(),
        record: impl FnOnce(&mut RrEngine) -> Result<(), RrError>,
        replay: impl FnOnce(&mut RrEngine) -> Result<(), RrError>,
    ) -> Result<(), RrError> {
        match self.mode {
            RrMode::Record => {
                if self.record_in_progress {
                    action();
                    Ok(())
                } else {
                    self.record_in_progress = true;
                    self.callsite = callsite;
                    self.set_prog_point(point);
                    action();
                    let result = record(self);
                    self.record_in_progress = false;
                    result
                }
            }
            RrMode::Replay => {
                self.callsite = callsite;
                self.set_prog_point(point);
                self.replay_skipped_calls(mem)?;
                replay(self)
            }
            RrMode::Off => {
                action();
                Ok(())
            }
        }
    }
}

fn apply<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn variant_name(v: &EntryVariant) -> &'static str {
    match v {
        EntryVariant::Input1(_) => "INPUT_1",
        EntryVariant::Input2(_) => "INPUT_2",
        EntryVariant::Input4(_) => "INPUT_4",
        EntryVariant::Input8(_) => "INPUT_8",
        EntryVariant::InterruptRequest(_) => "INTERRUPT_REQUEST",
        EntryVariant::SkippedCall(_) => "SKIPPED_CALL",
        EntryVariant::Last => "LAST",
    }
}
