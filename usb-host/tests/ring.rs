use crab_xhci::ring::TRBS_PER_SEGMENT;
use crab_xhci::{BusAddr, Ring, RingKind, SlotRef, TrbData, USBError};
use xhci::ring::trb::transfer::{self, Normal};

mod util;

use util::TestKernel;

fn normal(len: usize, chain: bool) -> transfer::Allowed {
    let mut trb = Normal::new();
    trb.set_data_buffer_pointer(0x2000_0000)
        .set_trb_transfer_length(len as _);
    if chain {
        trb.set_chain_bit();
    } else {
        trb.set_interrupt_on_completion();
    }
    transfer::Allowed::Normal(trb)
}

fn noop() -> transfer::Allowed {
    transfer::Allowed::Noop(transfer::Noop::new())
}

fn link_of(trb: TrbData) -> xhci::ring::trb::Link {
    match trb.transfer() {
        Some(transfer::Allowed::Link(link)) => link,
        other => panic!("not a link TRB: {other:?}"),
    }
}

#[test]
fn first_trb_is_handed_over_last() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Transfer, 1).unwrap();
    kernel.take_journal();

    let trbs = [normal(512, true), normal(512, true), normal(100, false)];
    let slots = ring.enqueue(&trbs).unwrap();
    assert_eq!(slots.len(), 3);

    let base = ring.bus_addr().raw();
    let first_ctrl = base + 12;
    let journal = kernel.take_journal();

    // 最后一次写入才把第一个 TRB 交给硬件
    let (addr, value) = *journal.last().unwrap();
    assert_eq!(addr, first_ctrl);
    assert_eq!(value & 1, 1);

    let first_write = journal.iter().position(|(a, _)| *a == first_ctrl).unwrap();
    assert_eq!(journal[first_write].1 & 1, 0, "first TRB written with inverted cycle");

    let last_idx = journal.len() - 1;
    for (i, (a, v)) in journal.iter().enumerate() {
        if *a >= base + 16 && *a < base + 48 {
            assert!(i < last_idx);
            if *a % 16 == 12 {
                assert_eq!(v & 1, 1, "following TRBs carry the producer cycle");
            }
        }
    }
}

#[test]
fn capacity_minus_one_fits() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Transfer, 1).unwrap();
    assert_eq!(ring.capacity(), TRBS_PER_SEGMENT - 1);
    assert!(ring.has_room(ring.capacity() - 1));
    assert!(!ring.has_room(ring.capacity()));

    let trbs = vec![noop(); ring.capacity()];
    assert_eq!(ring.enqueue(&trbs), Err(USBError::InsufficientRingSpace));
    assert!(ring.is_empty());

    ring.enqueue(&trbs[..ring.capacity() - 1]).unwrap();
    assert!(!ring.has_room(1));
    assert_eq!(ring.enqueue(&[noop()]), Err(USBError::InsufficientRingSpace));
}

#[test]
fn dequeue_frees_slots() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Transfer, 1).unwrap();
    for _ in 0..ring.capacity() - 1 {
        ring.enqueue(&[noop()]).unwrap();
    }
    assert!(!ring.has_room(1));

    for _ in 0..3 {
        ring.dequeue_advance();
    }
    assert!(ring.has_room(3));
    assert!(!ring.has_room(4));

    for _ in 0..3 {
        ring.enqueue(&[noop()]).unwrap();
    }
    assert!(!ring.has_room(1));
}

#[test]
fn link_handed_over_on_wrap() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Transfer, 1).unwrap();
    let link = SlotRef {
        seg: 0,
        idx: TRBS_PER_SEGMENT - 1,
    };
    assert!(ring.get(link).is_link());
    assert!(!ring.get(link).cycle_bit());
    assert!(link_of(ring.get(link)).toggle_cycle());

    for _ in 0..ring.capacity() {
        ring.enqueue(&[noop()]).unwrap();
        ring.dequeue_advance();
    }
    // 停在 Link TRB 上，还没交给硬件
    assert!(!ring.get(link).cycle_bit());
    assert!(ring.cycle());

    let slots = ring.enqueue(&[noop()]).unwrap();
    assert_eq!(slots, vec![SlotRef { seg: 0, idx: 0 }]);
    assert!(ring.get(link).cycle_bit());
    assert!(!ring.cycle());
    assert!(!ring.get(slots[0]).cycle_bit());
    assert_eq!(
        link_of(ring.get(link)).ring_segment_pointer(),
        ring.bus_addr().raw()
    );
}

#[test]
fn chained_td_crosses_segments() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Transfer, 2).unwrap();
    for _ in 0..TRBS_PER_SEGMENT - 2 {
        ring.enqueue(&[noop()]).unwrap();
        ring.dequeue_advance();
    }

    let slots = ring.enqueue(&[normal(512, true), normal(512, false)]).unwrap();
    assert_eq!(
        slots,
        vec![
            SlotRef {
                seg: 0,
                idx: TRBS_PER_SEGMENT - 2
            },
            SlotRef { seg: 1, idx: 0 },
        ]
    );

    let link_trb = ring.get(SlotRef {
        seg: 0,
        idx: TRBS_PER_SEGMENT - 1,
    });
    assert!(link_trb.cycle_bit());
    let link = link_of(link_trb);
    assert!(!link.toggle_cycle());
    assert_eq!(link.ring_segment_pointer(), ring.segment_base(1).unwrap().raw());
    #[cfg(not(feature = "link_chain_quirk"))]
    assert!(link.chain_bit());
    #[cfg(feature = "link_chain_quirk")]
    assert!(!link.chain_bit());

    // 第一段的 Link 不翻转 cycle
    assert!(ring.get(slots[1]).cycle_bit());
    assert_eq!(ring.locate(ring.slot_addr(slots[1])), Some(slots[1]));
}

#[test]
fn locate_rejects_foreign_addresses() {
    let kernel = TestKernel::new();
    let ring = Ring::new(&*kernel, RingKind::Transfer, 2).unwrap();
    let base = ring.bus_addr();
    assert_eq!(ring.locate(base), Some(SlotRef { seg: 0, idx: 0 }));
    assert_eq!(ring.locate(base.offset(8)), None);
    assert_eq!(ring.locate(BusAddr::new(0x10)), None);
    let seg1 = ring.segment_base(1).unwrap();
    assert_eq!(ring.locate(seg1.offset(32)), Some(SlotRef { seg: 1, idx: 2 }));
}

#[test]
fn event_ring_toggles_at_erst_wrap() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Event, 2).unwrap();
    assert_eq!(ring.capacity(), 2 * TRBS_PER_SEGMENT);
    assert_eq!(ring.enqueue(&[noop()]), Err(USBError::InvalidParameter));

    for _ in 0..TRBS_PER_SEGMENT {
        ring.dequeue_advance();
    }
    let cur = ring.dequeue_cursor();
    assert_eq!(cur.slot, SlotRef { seg: 1, idx: 0 });
    assert!(cur.cycle);

    for _ in 0..TRBS_PER_SEGMENT {
        ring.dequeue_advance();
    }
    let cur = ring.dequeue_cursor();
    assert_eq!(cur.slot, SlotRef { seg: 0, idx: 0 });
    assert!(!cur.cycle);
}

#[test]
fn noop_rewrite_keeps_cycle_and_links() {
    let kernel = TestKernel::new();
    let mut ring = Ring::new(&*kernel, RingKind::Transfer, 2).unwrap();
    for _ in 0..TRBS_PER_SEGMENT - 2 {
        ring.enqueue(&[noop()]).unwrap();
        ring.dequeue_advance();
    }
    let slots = ring
        .enqueue(&[normal(512, true), normal(512, true), normal(512, false)])
        .unwrap();
    let link_slot = SlotRef {
        seg: 0,
        idx: TRBS_PER_SEGMENT - 1,
    };
    let link_before = ring.get(link_slot);

    ring.td_to_noop(slots[0], slots[2]);

    for slot in &slots {
        let trb = ring.get(*slot);
        assert!(matches!(trb.transfer(), Some(transfer::Allowed::Noop(_))));
        assert!(trb.cycle_bit());
        assert_eq!(trb.transfer_len(), 0);
    }
    let link = ring.get(link_slot);
    assert_eq!(link.cycle_bit(), link_before.cycle_bit());
    assert_eq!(
        link_of(link).ring_segment_pointer(),
        link_of(link_before).ring_segment_pointer()
    );
    assert!(!link_of(link).chain_bit());
    assert_eq!(ring.sum_lengths(slots[0], slots[2]), 0);
}
