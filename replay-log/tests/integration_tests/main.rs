use replay_log::{
    Callsite, PhysicalMemory, ProgPoint, RrControl, RrEngine, RrError, RrMode,
};

#[derive(Default)]
struct MockMemory {
    writes: Vec<(u32, Vec<u8>)>,
    regions: Vec<(u32, u64, u64)>,
}

impl PhysicalMemory for MockMemory {
    fn phys_mem_write(&mut self, addr: u32, buf: &[u8]) {
        self.writes.push((addr, buf.to_vec()));
    }

    fn register_mem_region(&mut self, start_addr: u32, size: u64, phys_offset: u64) {
        self.regions.push((start_addr, size, phys_offset));
    }
}

fn log_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn port_read_and_interrupt_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir, "run.rr");

    // record: one port read at (100, 0, 5), one interrupt at (120, 0, 9)
    let mut engine = RrEngine::new();
    engine.begin_record_to(&path).unwrap();
    engine.set_callsite(Callsite::CPU_INB);
    engine.set_prog_point(ProgPoint::new(100, 0, 5));
    engine.record_input_1(0xab).unwrap();
    engine.set_callsite(Callsite::MAIN_LOOP);
    engine.set_prog_point(ProgPoint::new(120, 0, 9));
    engine.record_interrupt_request(0x4).unwrap();
    engine.end_record().unwrap();
    assert!(engine.is_off());

    // replay: too early is "not yet" and leaves the value untouched
    let mut engine = RrEngine::new();
    engine.begin_replay_from(&path).unwrap();
    engine.set_callsite(Callsite::CPU_INB);
    engine.set_prog_point(ProgPoint::new(100, 0, 4));
    let mut val = 0u8;
    assert!(!engine.replay_input_1(&mut val).unwrap());
    assert_eq!(val, 0);

    // at the recorded point the stubbed port read yields the log's byte
    engine.set_prog_point(ProgPoint::new(100, 0, 5));
    assert!(engine.replay_input_1(&mut val).unwrap());
    assert_eq!(val, 0xab);

    engine.set_callsite(Callsite::MAIN_LOOP);
    engine.set_prog_point(ProgPoint::new(120, 0, 9));
    let mut req = 0u16;
    assert!(engine.replay_interrupt_request(&mut req).unwrap());
    assert_eq!(req, 0x4);

    assert!(engine.replay_finished());
    engine.end_replay(false).unwrap();
}

#[test]
fn running_past_an_entry_is_a_fatal_divergence() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir, "diverge.rr");

    let mut engine = RrEngine::new();
    engine.begin_record_to(&path).unwrap();
    engine.set_prog_point(ProgPoint::new(0, 0, 5));
    engine.record_input_1(0x11).unwrap();
    engine.end_record().unwrap();

    let mut engine = RrEngine::new();
    engine.begin_replay_from(&path).unwrap();
    engine.set_prog_point(ProgPoint::new(0, 0, 6));
    let mut val = 0u8;
    let err = engine.replay_input_1(&mut val).unwrap_err();
    match err {
        RrError::Divergence { current, recorded } => {
            assert_eq!(current, ProgPoint::new(0, 0, 6));
            assert_eq!(recorded, ProgPoint::new(0, 0, 5));
        }
        other => panic!("expected divergence, got {other}"),
    }
    engine.end_replay(true).unwrap();
    assert!(engine.is_off());
}

#[test]
fn skipped_calls_replay_dma_and_region_registration() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir, "dma.rr");

    let mut engine = RrEngine::new();
    engine.begin_record_to(&path).unwrap();
    engine.set_callsite(Callsite::CPU_PHYSICAL_MEMORY_RW_1);
    engine.set_prog_point(ProgPoint::new(0x30, 0, 12));
    engine.record_mem_rw(0x9000, &[0xde, 0xad], true).unwrap();
    // a device read of guest memory: recorded, but nothing to redo
    engine.record_mem_rw(0x9100, &[0; 8], false).unwrap();
    engine
        .record_reg_mem_region(0xa000_0000, 0x1000, 0x20_0000)
        .unwrap();
    engine.end_record().unwrap();

    let mut engine = RrEngine::new();
    let mut mem = MockMemory::default();
    engine.begin_replay_from(&path).unwrap();
    engine.set_prog_point(ProgPoint::new(0x30, 0, 12));
    engine.replay_skipped_calls(&mut mem).unwrap();

    assert_eq!(mem.writes, vec![(0x9000, vec![0xde, 0xad])]);
    assert_eq!(mem.regions, vec![(0xa000_0000, 0x1000, 0x20_0000)]);
    assert!(engine.replay_finished());
}

#[test]
fn nested_record_sites_log_one_composite_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir, "nested.rr");

    let mut engine = RrEngine::new();
    let mut mem = MockMemory::default();
    engine.begin_record_to(&path).unwrap();

    // outer callsite records; the nested one only runs its action
    let mut outer_val = 0x55u8;
    engine
        .at_callsite(
            Callsite::CPU_INB,
            ProgPoint::new(0x10, 0, 3),
            &mut mem,
            || (),
            |eng| {
                // emulation of the outer action re-enters another wrapped
                // site; the latch keeps it from logging separately
                let inner = eng.at_callsite(
                    Callsite::IO_READ_0,
                    ProgPoint::new(0x10, 0, 3),
                    &mut MockMemory::default(),
                    || (),
                    |eng| eng.record_input_4(0xffff_ffff),
                    |_| Ok(()),
                );
                inner?;
                eng.record_input_1(outer_val)
            },
            |_| Ok(()),
        )
        .unwrap();
    engine.end_record().unwrap();

    // replay sees exactly one input entry
    let mut engine = RrEngine::new();
    engine.begin_replay_from(&path).unwrap();
    engine.set_callsite(Callsite::CPU_INB);
    engine.set_prog_point(ProgPoint::new(0x10, 0, 3));
    outer_val = 0;
    assert!(engine.replay_input_1(&mut outer_val).unwrap());
    assert_eq!(outer_val, 0x55);
    assert!(engine.replay_finished());
}

#[test]
fn monitor_requests_drive_the_mode_between_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir, "monitored.rr");

    let control = RrControl::new();
    let mut engine = RrEngine::new();

    control.begin_record(&path);
    engine.service_requests(&control).unwrap();
    assert_eq!(engine.mode(), RrMode::Record);
    assert!(engine.wants_tb_flush());
    engine.tb_flush_done();

    // a nested record request is refused, not fatal
    control.begin_record(log_path(&dir, "other.rr"));
    engine.service_requests(&control).unwrap();
    assert_eq!(engine.mode(), RrMode::Record);

    engine.set_prog_point(ProgPoint::new(1, 2, 3));
    engine.record_input_2(0x1234).unwrap();

    control.end_record();
    engine.service_requests(&control).unwrap();
    assert_eq!(engine.mode(), RrMode::Off);

    control.begin_replay(&path);
    engine.service_requests(&control).unwrap();
    assert_eq!(engine.mode(), RrMode::Replay);

    control.end_replay(false);
    engine.service_requests(&control).unwrap();
    assert_eq!(engine.mode(), RrMode::Off);
}

#[test]
fn interrupt_countdown_tracks_the_instruction_delta() {
    let mut engine = RrEngine::new();
    engine.set_num_instr_before_next_interrupt(100);
    engine.set_prog_point(ProgPoint::new(0, 0, 0));
    engine.set_prog_point(ProgPoint::new(0x40, 0, 30));
    assert_eq!(engine.num_instr_before_next_interrupt(), 70);
    engine.set_prog_point(ProgPoint::new(0x44, 0, 30));
    assert_eq!(engine.num_instr_before_next_interrupt(), 70);
}

#[test]
fn replayed_inputs_match_recorded_inputs_bitwise() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir, "widths.rr");

    let inputs: [(u64, u64); 4] = [(1, 0x8f), (2, 0xbeef), (3, 0xdead_beef), (4, u64::MAX - 7)];

    let mut engine = RrEngine::new();
    engine.begin_record_to(&path).unwrap();
    engine.set_prog_point(ProgPoint::new(0, 0, inputs[0].0));
    engine.record_input_1(inputs[0].1 as u8).unwrap();
    engine.set_prog_point(ProgPoint::new(0, 0, inputs[1].0));
    engine.record_input_2(inputs[1].1 as u16).unwrap();
    engine.set_prog_point(ProgPoint::new(0, 0, inputs[2].0));
    engine.record_input_4(inputs[2].1 as u32).unwrap();
    engine.set_prog_point(ProgPoint::new(0, 0, inputs[3].0));
    engine.record_input_8(inputs[3].1).unwrap();
    engine.end_record().unwrap();

    let mut engine = RrEngine::new();
    engine.begin_replay_from(&path).unwrap();

    engine.set_prog_point(ProgPoint::new(0, 0, 1));
    let mut b = 0u8;
    assert!(engine.replay_input_1(&mut b).unwrap());
    assert_eq!(u64::from(b), inputs[0].1);

    engine.set_prog_point(ProgPoint::new(0, 0, 2));
    let mut w = 0u16;
    assert!(engine.replay_input_2(&mut w).unwrap());
    assert_eq!(u64::from(w), inputs[1].1);

    engine.set_prog_point(ProgPoint::new(0, 0, 3));
    let mut l = 0u32;
    assert!(engine.replay_input_4(&mut l).unwrap());
    assert_eq!(u64::from(l), inputs[2].1);

    engine.set_prog_point(ProgPoint::new(0, 0, 4));
    let mut q = 0u64;
    assert!(engine.replay_input_8(&mut q).unwrap());
    assert_eq!(q, inputs[3].1);

    // replay ends at the same program point the recording ended at
    assert!(engine.replay_finished());
    assert_eq!(engine.prog_point(), ProgPoint::new(0, 0, 4));
}
