use retrace::taint_api::{add_taint_ram, taint_shadow_geometry};
use retrace::{x86_layout, AddressTranslate};
use taint_runtime::{Addr, LabelMode, TaintRuntime};

/// Identity paging with one unmapped page.
struct FlatPaging {
    unmapped: std::ops::Range<u64>,
}

impl AddressTranslate for FlatPaging {
    fn virt_to_phys(&self, vaddr: u64) -> Option<u64> {
        if self.unmapped.contains(&vaddr) {
            None
        } else {
            Some(vaddr)
        }
    }
}

fn runtime() -> TaintRuntime {
    let geom = taint_shadow_geometry(&x86_layout(), 1 << 20, 0x10000, 1 << 16, 64);
    TaintRuntime::new(geom).unwrap()
}

#[test]
fn add_taint_ram_assigns_consecutive_labels() {
    let env = FlatPaging { unmapped: 0..0 };
    let mut rt = runtime();
    rt.bump_label_count(10);
    add_taint_ram(&env, &mut rt, 0x2000, 4).unwrap();

    for (i, expected) in (10u32..14).enumerate() {
        let set = rt.shad.query(&Addr::maddr(0x2000 + i as u64)).unwrap();
        assert_eq!(set.to_vec(), vec![expected]);
    }
    assert_eq!(rt.shad.query_ram(0x2004), 0);
    assert_eq!(rt.label_count(), 14);
}

#[test]
fn binary_mode_labels_every_byte_with_one() {
    let env = FlatPaging { unmapped: 0..0 };
    let mut rt = runtime();
    rt.set_label_mode(LabelMode::Binary);
    add_taint_ram(&env, &mut rt, 0x2000, 4).unwrap();
    for i in 0..4 {
        assert_eq!(rt.shad.query(&Addr::maddr(0x2000 + i)).unwrap().to_vec(), vec![1]);
    }
}

#[test]
fn unmapped_bytes_are_skipped_but_the_counter_still_advances() {
    let env = FlatPaging {
        unmapped: 0x3001..0x3003,
    };
    let mut rt = runtime();
    add_taint_ram(&env, &mut rt, 0x3000, 4).unwrap();

    assert_eq!(rt.shad.query_ram(0x3000), 1);
    assert_eq!(rt.shad.query_ram(0x3001), 0);
    assert_eq!(rt.shad.query_ram(0x3002), 0);
    assert_eq!(rt.shad.query_ram(0x3003), 1);
    // the skipped bytes' labels are burned, not reassigned
    assert_eq!(rt.label_count(), 4);
    assert!(rt.shad.query(&Addr::maddr(0x3003)).unwrap().contains(3));
}

#[test]
fn geometry_covers_the_whole_state_struct() {
    let layout = x86_layout();
    let geom = taint_shadow_geometry(&layout, 0, 0x1000, 0, 16);
    assert_eq!(geom.num_regs, 8);
    assert_eq!(geom.word_size, 4);
    // every classified GSPEC cell must fit the special shadow
    let top = layout.classify(layout.state_size - 1).unwrap();
    match top.kind {
        taint_runtime::AddrKind::Gspec(gs) => {
            assert!(gs - geom.num_regs < geom.num_spec_cells);
        }
        other => panic!("unexpected classification {other:?}"),
    }
}
