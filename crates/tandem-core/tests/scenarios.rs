//! End-to-end scenarios for the double-execution core: clean commits,
//! aliasing, injected upsets, vm-stack jitter, counter skid, stale
//! parked entries, campaign determinism, and resource hygiene.

use tandem_core::addr::{PhysAddr, VirtAddr};
use tandem_core::attr::PageAttr;
use tandem_core::exec::{run_workload, Op, Workload};
use tandem_core::machine::{Machine, MachineConfig};
use tandem_core::paging::PageKind;
use tandem_core::regs::RegisterFile;
use tandem_core::report::ReportCtx;
use tandem_core::shadow::CowFault;
use tandem_core::thread::{Thread, ThreadKind};
use tandem_inject::faults::Seu;
use tandem_inject::injector::{InjectorConfig, SeuInjector};
use tandem_inject::schedule::SeuScheduleBuilder;

fn machine_with(budget: u64, skid: [u64; 2]) -> Machine {
    Machine::new(MachineConfig {
        frames: 128,
        budget,
        pmi_skid: skid,
        trace_depth: 32,
    })
}

fn map_page(m: &mut Machine, t: &mut Thread, virt: u64) -> PhysAddr {
    let phys = m.frames.alloc_page().unwrap();
    let table = match t.kind {
        ThreadKind::Native => &mut t.aspace.host,
        ThreadKind::Vcpu => &mut t.aspace.guest,
    };
    table.map(
        VirtAddr(virt),
        phys,
        PageAttr::user_data().shadowed(),
        PageKind::Normal,
    );
    phys
}

// ─── S1: clean element, single page, budget-bounded ──────────────────

#[test]
fn s1_clean_element_commits_via_budget() {
    let mut m = machine_with(8, [0, 0]);
    let mut t = Thread::new("s1", "pd0", ThreadKind::Native);
    let phys = map_page(&mut m, &mut t, 0x4000);

    let mut ops = vec![Op::Write {
        addr: VirtAddr(0x4000),
        val: 0x1122_3344,
    }];
    ops.extend(std::iter::repeat(Op::Nop).take(12));
    let outcome = run_workload(&mut t, &mut m, &Workload::new(ops), None).unwrap();

    assert!(outcome.pes >= 2, "budget of 8 must split 13 instructions");
    assert_eq!(outcome.commits, outcome.pes);
    assert_eq!(outcome.seus, 0);
    assert_eq!(m.frames.read_word(phys, 0), 0x1122_3344);
    let mapping = t.aspace.host.lookup(VirtAddr(0x4000)).unwrap();
    assert_eq!(mapping.phys, phys, "mapping points back at the original frame");
    assert!(mapping.attr.cow && !mapping.attr.writable);
}

// ─── S2: aliased pages share one shadow pair ─────────────────────────

#[test]
fn s2_aliased_mappings_share_shadows() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("s2", "pd0", ThreadKind::Native);
    let phys = map_page(&mut m, &mut t, 0x4000);
    // Second mapping of the same frame.
    t.aspace.host.map(
        VirtAddr(0x8000),
        phys,
        PageAttr::user_data().shadowed(),
        PageKind::Normal,
    );

    let wl = Workload::new(vec![
        Op::WriteByte {
            addr: VirtAddr(0x4000),
            val: 0xAA,
        },
        Op::WriteByte {
            addr: VirtAddr(0x8001),
            val: 0xBB,
        },
    ]);
    let outcome = run_workload(&mut t, &mut m, &wl, None).unwrap();

    assert_eq!(outcome.commits, 1);
    assert_eq!(m.frames.page(phys)[0], 0xAA, "write through first alias");
    assert_eq!(m.frames.page(phys)[1], 0xBB, "write through second alias");
    assert_eq!(
        t.shadows.parked_len(),
        2,
        "both twins survive the element together"
    );
    // One mapped frame plus exactly one shared order-1 shadow pair.
    assert_eq!(
        m.frames.in_use(),
        3,
        "a single shadow allocation serves both aliases"
    );
    for v in [0x4000u64, 0x8000] {
        let mp = t.aspace.host.lookup(VirtAddr(v)).unwrap();
        assert_eq!(mp.phys, phys);
        assert!(mp.attr.cow);
    }
}

// ─── S3: injected upset rolls back and re-executes cleanly ───────────

#[test]
fn s3_shadow_bit_flip_is_masked_by_reexecution() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("s3", "pd0", ThreadKind::Native);
    let phys = map_page(&mut m, &mut t, 0x4000);

    let schedule = SeuScheduleBuilder::new()
        .at_pe(
            0,
            Seu::ShadowBit {
                entry: 0,
                run: 0,
                byte: 7,
                bit: 2,
            },
        )
        .build();
    let mut inj = SeuInjector::new(InjectorConfig {
        seed: 9,
        schedule: Some(schedule),
        ..Default::default()
    });

    let wl = Workload::new(vec![
        Op::Write {
            addr: VirtAddr(0x4000),
            val: 0x0101_0101_0101_0101,
        },
        Op::Write {
            addr: VirtAddr(0x4008),
            val: 0x0202_0202_0202_0202,
        },
    ]);
    let outcome = run_workload(&mut t, &mut m, &wl, Some(&mut inj)).unwrap();

    assert_eq!(outcome.injected, 1);
    assert_eq!(outcome.retries, 1, "one transparent re-execution");
    assert_eq!(outcome.seus, 0, "memory-only flip recovers without a verdict");
    assert_eq!(outcome.commits, outcome.pes);
    assert_eq!(m.frames.read_word(phys, 0), 0x0101_0101_0101_0101);
    assert_eq!(m.frames.read_word(phys, 1), 0x0202_0202_0202_0202);
    assert_eq!(m.counters.rollbacks, 1);
    assert_eq!(m.counters.recovered, 1);
}

#[test]
fn s3b_register_flip_is_a_detected_upset() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("s3b", "pd0", ThreadKind::Native);
    let phys = map_page(&mut m, &mut t, 0x4000);

    // RDX is never written by the workload, so the flip survives to the
    // comparison and surfaces as a register divergence.
    let schedule = SeuScheduleBuilder::new()
        .at_pe(0, Seu::RegisterBit { reg: 3, bit: 5 })
        .build();
    let mut inj = SeuInjector::new(InjectorConfig {
        seed: 10,
        schedule: Some(schedule),
        ..Default::default()
    });

    let wl = Workload::new(vec![
        Op::Write {
            addr: VirtAddr(0x4000),
            val: 7,
        },
        Op::Nop,
        Op::Nop,
    ]);
    let outcome = run_workload(&mut t, &mut m, &wl, Some(&mut inj)).unwrap();

    assert_eq!(outcome.seus, 1, "register divergence is a detected upset");
    assert_eq!(outcome.retries, 1, "localization ends in a re-execution");
    assert_eq!(outcome.commits, outcome.pes);
    assert_eq!(m.frames.read_word(phys, 0), 7);
    assert_eq!(m.counters.seu_detected, 1);
    assert_eq!(t.regs.rdx, 0, "the flip never leaks into committed state");
}

// ─── S4: vm-stack jitter on a vCPU ───────────────────────────────────

#[test]
fn s4_guest_stack_jitter_moves_page_to_vm_stack_queue() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("s4", "vm0", ThreadKind::Vcpu);
    let stack_phys = map_page(&mut m, &mut t, 0xffff_8000_0000_1000);
    // A guest page under RSP so the fault snapshot has something to read.
    let _rsp_page = map_page(&mut m, &mut t, 0x3000);
    t.regs.rsp = 0x3020;

    let wl = Workload::new(vec![Op::Jitter {
        addr: [
            VirtAddr(0xffff_8000_0000_1050),
            VirtAddr(0xffff_8000_0000_1060),
        ],
        val: [0x01, 0x02],
    }]);
    let outcome = run_workload(&mut t, &mut m, &wl, None).unwrap();

    assert_eq!(outcome.commits, 1);
    assert_eq!(outcome.seus, 0, "stack jitter is not an upset");
    assert_eq!(outcome.retries, 0);
    assert_eq!(t.shadows.vm_stack_len(), 1, "page adopted by the vm-stack queue");
    // The reconciled image is the second run's view.
    assert_eq!(m.frames.read_word(stack_phys, 0x60 / 8), 0x02);
    let mp = t
        .aspace
        .guest
        .lookup(VirtAddr(0xffff_8000_0000_1000))
        .unwrap();
    assert!(mp.attr.writable && !mp.attr.cow, "queued page stays writable");
}

// ─── S5: counter skid reconciles by single-stepping ──────────────────

#[test]
fn s5_uneven_skid_single_steps_the_shorter_run() {
    let mut m = machine_with(16, [5, 1]);
    let mut t = Thread::new("s5", "pd0", ThreadKind::Native);
    map_page(&mut m, &mut t, 0x4000);

    let ops: Vec<Op> = (0..60)
        .map(|i| Op::Write {
            addr: VirtAddr(0x4000 + (i % 64) * 8),
            val: i + 1,
        })
        .collect();
    let outcome = run_workload(&mut t, &mut m, &Workload::new(ops), None).unwrap();

    assert_eq!(outcome.seus, 0, "skid must never look like an upset");
    assert_eq!(outcome.retries, 0);
    assert_eq!(outcome.commits, outcome.pes);
    assert!(
        m.counters.pmi_single_steps >= 4,
        "a 4-instruction gap needs at least 4 catch-up steps, saw {}",
        m.counters.pmi_single_steps
    );
}

// ─── S6: stale parked entry is dropped silently ──────────────────────

#[test]
fn s6_stale_park_is_dropped_without_error() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("s6", "pd0", ThreadKind::Native);
    let _phys = map_page(&mut m, &mut t, 0x4000);

    let wl = Workload::new(vec![Op::Write {
        addr: VirtAddr(0x4000),
        val: 1,
    }]);
    run_workload(&mut t, &mut m, &wl, None).unwrap();
    assert_eq!(t.shadows.parked_len(), 1);

    // The kernel remaps the page out-of-band between elements.
    let other = m.frames.alloc_page().unwrap();
    t.aspace.host.map(
        VirtAddr(0x4000),
        other,
        PageAttr::user_data().shadowed(),
        PageKind::Normal,
    );

    let in_use_before = m.frames.in_use();
    let wl2 = Workload::new(vec![Op::Nop]);
    let outcome = run_workload(&mut t, &mut m, &wl2, None).unwrap();

    assert_eq!(outcome.commits, 1);
    assert_eq!(t.shadows.parked_len(), 0, "stale entry gone");
    assert_eq!(t.shadows.live_len(), 0);
    assert_eq!(
        m.frames.in_use(),
        in_use_before - 2,
        "its shadow pair went back to the allocator"
    );
}

// ─── S7: campaigns are deterministic under a fixed seed ──────────────

fn campaign(seed: u64) -> (tandem_core::exec::WorkloadOutcome, Vec<u32>) {
    let mut m = machine_with(16, [1, 0]);
    let mut t = Thread::new("s7", "pd0", ThreadKind::Native);
    let mut pages = Vec::new();
    for p in 0..4u64 {
        pages.push(map_page(&mut m, &mut t, 0x10_0000 + p * 0x1000));
    }
    let ops: Vec<Op> = (0..200)
        .map(|i| Op::Write {
            addr: VirtAddr(0x10_0000 + (i % 4) * 0x1000 + (i % 64) * 8),
            val: i.wrapping_mul(0x9e37_79b9),
        })
        .collect();
    let mut inj = SeuInjector::new(InjectorConfig {
        seed,
        random: true,
        random_period: 4,
        ..Default::default()
    });
    let outcome = run_workload(&mut t, &mut m, &Workload::new(ops), Some(&mut inj)).unwrap();
    let crcs = pages.iter().map(|&p| m.frames.crc(p)).collect();
    (outcome, crcs)
}

#[test]
fn s7_same_seed_reproduces_the_campaign() {
    let (o1, c1) = campaign(1234);
    let (o2, c2) = campaign(1234);
    assert_eq!(o1, o2, "outcome must be bit-for-bit reproducible");
    assert_eq!(c1, c2, "and so must the committed memory");
    assert_eq!(o1.commits, o1.pes, "every element eventually commits");
}

// ─── S8: keep_cow pins carried entries ───────────────────────────────

#[test]
fn s8_keep_cow_retains_untouched_carried_entries() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("s8", "pd0", ThreadKind::Native);
    map_page(&mut m, &mut t, 0x4000);

    let wl = Workload::new(vec![Op::Write {
        addr: VirtAddr(0x4000),
        val: 5,
    }]);
    run_workload(&mut t, &mut m, &wl, None).unwrap();
    assert_eq!(t.shadows.parked_len(), 1);

    // Untouched next element would normally end the shadowing.
    t.shadows.keep_cow = true;
    let wl2 = Workload::new(vec![Op::Nop, Op::Nop]);
    run_workload(&mut t, &mut m, &wl2, None).unwrap();
    assert_eq!(t.shadows.parked_len(), 1, "keep_cow pinned the entry");
    assert!(!t.shadows.keep_cow, "flag consumed by commit");

    // Without the pin the stable page stops being shadowed.
    let wl3 = Workload::new(vec![Op::Nop, Op::Nop]);
    run_workload(&mut t, &mut m, &wl3, None).unwrap();
    assert_eq!(t.shadows.parked_len(), 0);
}

// ─── S9: no frame leaks across a whole campaign ──────────────────────

#[test]
fn s9_frames_balance_after_campaign() {
    let mut m = machine_with(16, [2, 0]);
    let mut t = Thread::new("s9", "pd0", ThreadKind::Native);
    for p in 0..4u64 {
        map_page(&mut m, &mut t, 0x10_0000 + p * 0x1000);
    }
    let mapped = m.frames.in_use();

    let ops: Vec<Op> = (0..160)
        .map(|i| Op::Write {
            addr: VirtAddr(0x10_0000 + (i % 4) * 0x1000 + (i % 64) * 8),
            val: i,
        })
        .collect();
    let mut inj = SeuInjector::new(InjectorConfig {
        seed: 77,
        random: true,
        random_period: 4,
        ..Default::default()
    });
    run_workload(&mut t, &mut m, &Workload::new(ops), Some(&mut inj)).unwrap();

    // Whatever survives is exactly the parked/vm-stack population.
    t.shadows.release_all(&mut m.frames, &mut t.aspace);
    assert_eq!(
        m.frames.in_use(),
        mapped,
        "every shadow pair returned to the allocator"
    );
}

// ─── Atomicity: observers see pre- or post-state, never a mix ────────

#[test]
fn external_observer_never_sees_intermediate_state() {
    let mut m = machine_with(64, [0, 0]);
    let mut t = Thread::new("atom", "pd0", ThreadKind::Native);
    let phys = map_page(&mut m, &mut t, 0x4000);
    m.frames.write_word(phys, 0, 0xA1);
    m.frames.write_word(phys, 1, 0xA2);

    t.start_pe(&mut m);
    let mapping = t.aspace.host.lookup(VirtAddr(0x4000)).unwrap();
    let regs = RegisterFile::default();
    let origin = t.origin(VirtAddr(0x4000));
    t.shadows
        .resolve_cow_fault(
            &mut m.frames,
            &mut t.aspace,
            &regs,
            CowFault {
                origin,
                virt: VirtAddr(0x4000),
                phys: mapping.phys,
                attr: mapping.attr,
                kind: mapping.kind,
                opcode: 0x89,
            },
            &mut m.counters,
        )
        .unwrap();

    // Both runs write through the shadows.
    let sh = t.shadows.entry(t.shadows.live_nth(0).unwrap()).shadow;
    for s in sh {
        m.frames.write_word(s, 0, 0xB1);
        m.frames.write_word(s, 1, 0xB2);
    }

    // A DMA engine or another CPU reading the original frame mid-element
    // still sees the pre-element content.
    assert_eq!(m.frames.read_word(phys, 0), 0xA1);
    assert_eq!(m.frames.read_word(phys, 1), 0xA2);

    let ctx = ReportCtx::default();
    assert!(t
        .shadows
        .compare(&mut m.frames, &mut t.aspace, false, &ctx)
        .is_none());
    t.shadows
        .commit(&mut m.frames, &mut t.aspace, false, &mut m.counters);

    // After the commit point, only the post-element content.
    assert_eq!(m.frames.read_word(phys, 0), 0xB1);
    assert_eq!(m.frames.read_word(phys, 1), 0xB2);
}

// ─── Drain: element boundaries leave the live set empty ──────────────

#[test]
fn live_set_drains_at_every_boundary() {
    let mut m = machine_with(8, [0, 0]);
    let mut t = Thread::new("drain", "pd0", ThreadKind::Native);
    map_page(&mut m, &mut t, 0x4000);
    let ops: Vec<Op> = (0..50)
        .map(|i| Op::Write {
            addr: VirtAddr(0x4000 + (i % 32) * 8),
            val: i,
        })
        .collect();
    run_workload(&mut t, &mut m, &Workload::new(ops), None).unwrap();
    assert_eq!(t.shadows.live_len(), 0, "live set empty at UNLAUNCHED");
    assert!(t.shadows.parked_len() <= 1, "at most the hot page survives");
}

// ─── REP instruction straddling the budget ───────────────────────────

#[test]
fn rep_store_across_budget_boundary_commits() {
    let mut m = machine_with(8, [0, 0]);
    let mut t = Thread::new("rep", "pd0", ThreadKind::Native);
    let phys = map_page(&mut m, &mut t, 0x4000);

    // Shadow the page in a first element so the REP element takes no
    // fault and both runs stop at the same iteration.
    let wl = Workload::new(vec![
        Op::Write {
            addr: VirtAddr(0x4000),
            val: 0,
        },
        Op::Rdtsc,
        Op::Rep {
            addr: VirtAddr(0x4000),
            count: 20,
            val: 0x7777,
        },
    ]);
    let outcome = run_workload(&mut t, &mut m, &wl, None).unwrap();

    assert_eq!(outcome.seus, 0);
    assert_eq!(outcome.commits, outcome.pes);
    assert!(outcome.pes >= 3, "20 iterations under a budget of 8");
    for i in 0..20 {
        assert_eq!(m.frames.read_word(phys, i), 0x7777, "word {i}");
    }
    assert_eq!(t.regs.rcx, 0);
}
