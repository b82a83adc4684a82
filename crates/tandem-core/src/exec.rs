//! Deterministic workload execution.
//!
//! The executor plays a scripted sequence of guest operations through a
//! thread, acting as the machine's user/guest context: it delivers COW
//! faults to the interposer, stops runs at the instruction budget or at
//! non-replayable instructions, re-executes the script for the second
//! run, and performs single instructions on request while the driver is
//! reconciling or localizing.
//!
//! One operation retires one instruction (a REP operation retires one
//! per iteration under a single RIP), which keeps the retired-instruction
//! clock, the single-stepper, and the script cursor in lockstep.

use crate::addr::{PhysAddr, VirtAddr, PAGE_SIZE, WORD_SIZE};
use crate::driver::{Decision, PeStop};
use crate::machine::Machine;
use crate::paging::PageFaultErr;
use crate::shadow::CowFault;
use crate::thread::Thread;
use log::info;
use tandem_inject::{Seu, SeuInjector};
use thiserror::Error;

/// One scripted guest operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Nop,
    /// Store a word; also lands in RAX.
    Write { addr: VirtAddr, val: u64 },
    /// Store a byte.
    WriteByte { addr: VirtAddr, val: u8 },
    /// Load a word into RAX.
    Load { addr: VirtAddr },
    /// REP-prefixed store: `count` words from `addr` upward, retiring
    /// `count` times under one RIP.
    Rep { addr: VirtAddr, count: u32, val: u64 },
    /// A store whose target and value depend on the run — models an
    /// asynchronous guest interrupt landing on the kernel stack at
    /// different points across runs.
    Jitter { addr: [VirtAddr; 2], val: [u64; 2] },
    /// Port I/O: deterministic stop, executes once supervised.
    Pio,
    /// Device memory access: deterministic stop, never shadowed.
    Mmio,
    /// Timestamp read: deterministic stop, executes once supervised.
    Rdtsc,
}

/// First opcode byte the instruction decoder would see for an op.
fn opcode_of(op: Op) -> u8 {
    match op {
        Op::Nop => 0x90,
        Op::Write { .. } | Op::Jitter { .. } | Op::Mmio => 0x89,
        Op::WriteByte { .. } => 0x88,
        Op::Load { .. } => 0x8b,
        Op::Rep { .. } => 0xf3,
        Op::Pio => 0xe6,
        Op::Rdtsc => 0x0f,
    }
}

fn deterministic_stop(op: Op) -> Option<PeStop> {
    match op {
        Op::Pio => Some(PeStop::Pio),
        Op::Mmio => Some(PeStop::Mmio),
        Op::Rdtsc => Some(PeStop::Rdtsc),
        _ => None,
    }
}

/// A scripted workload.
#[derive(Clone, Debug, Default)]
pub struct Workload {
    pub ops: Vec<Op>,
}

impl Workload {
    pub fn new(ops: Vec<Op>) -> Self {
        Workload { ops }
    }
}

/// Tally of a workload execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadOutcome {
    /// Elements started (retries not counted).
    pub pes: u64,
    /// Elements committed.
    pub commits: u64,
    /// Transparent re-executions after rollback.
    pub retries: u64,
    /// Divergences surfaced as detected upsets.
    pub seus: u64,
    /// Upsets the injector handed out.
    pub injected: u64,
}

/// Fatal execution errors. Anything recoverable never reaches the
/// workload: it only observes commits, a kill, or a transparent stall.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A native page fault with no master table to demand-page from.
    /// A full kernel would map the page and resume; this model treats
    /// an unmapped access as a scripting error.
    #[error("native page fault at {virt}: nothing to demand-page from")]
    Unmapped { virt: VirtAddr },
    /// The thread died (allocation failure during interposition, or a
    /// big-page fault).
    #[error("thread {name} killed: {reason}")]
    ThreadKilled { name: String, reason: String },
}

/// Disposition of a page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PfOutcome {
    /// The fault was a COW fault and the interposer resolved it.
    CowResolved,
    /// Not ours: fall through to the native demand-paging path.
    Native,
}

/// The page-fault gate: the only interaction between the shadow
/// subsystem and ordinary demand paging. A user-mode write fault on a
/// COW-marked mapping goes to the interposer; everything else is native.
pub fn handle_page_fault(
    thread: &mut Thread,
    m: &mut Machine,
    virt: VirtAddr,
    err: PageFaultErr,
    opcode: u8,
) -> Result<PfOutcome, ExecError> {
    let space = thread.space();
    if !err.user || !thread.aspace.table(space).is_cow_fault(virt, err) {
        return Ok(PfOutcome::Native);
    }
    let mapping = thread
        .aspace
        .table(space)
        .lookup(virt)
        .expect("COW classification implies a mapping");
    let fault = CowFault {
        origin: thread.origin(virt),
        virt,
        phys: mapping.phys,
        attr: mapping.attr,
        kind: mapping.kind,
        opcode,
    };
    let regs = thread.regs;
    match thread.shadows.resolve_cow_fault(
        &mut m.frames,
        &mut thread.aspace,
        &regs,
        fault,
        &mut m.counters,
    ) {
        Ok(_) => Ok(PfOutcome::CowResolved),
        Err(e) => {
            // Fatal to the element: roll everything back and kill the
            // thread. No partial commit survives.
            thread.abort_pe(m);
            Err(ExecError::ThreadKilled {
                name: thread.name.clone(),
                reason: e.to_string(),
            })
        }
    }
}

/// Translate a store through the thread's table, taking (and resolving)
/// a COW fault if the page is write-protected.
fn guest_store(
    thread: &mut Thread,
    m: &mut Machine,
    addr: VirtAddr,
    opcode: u8,
) -> Result<PhysAddr, ExecError> {
    loop {
        let mapping = thread.aspace.table(thread.space()).lookup(addr);
        if let Some(mp) = mapping {
            if mp.attr.present && mp.attr.writable {
                return Ok(mp.phys);
            }
        }
        // Write fault. The exception entry bumps the counter once; the
        // canonicalisation formula backs these out later.
        m.counters.exceptions += 1;
        thread.pe.exc_counter += 1;
        m.clock.retire(1);
        let err = PageFaultErr {
            user: true,
            write: true,
        };
        match handle_page_fault(thread, m, addr, err, opcode)? {
            PfOutcome::CowResolved => continue,
            PfOutcome::Native => {
                // A user-space native fault ends the element before the
                // demand-paging path runs. There is no master table to
                // page from here, so the element is cancelled and the
                // fault surfaces as a scripting error.
                thread.abort_pe(m);
                return Err(ExecError::Unmapped {
                    virt: addr.page_base(),
                });
            }
        }
    }
}

enum OpOutcome {
    Retired,
    /// A REP iteration completed but the instruction has not.
    RepContinues,
}

fn execute_op(
    thread: &mut Thread,
    m: &mut Machine,
    op: Op,
    run: usize,
    rep: &mut u32,
) -> Result<OpOutcome, ExecError> {
    match op {
        Op::Nop => {
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        Op::Write { addr, val } => {
            let phys = guest_store(thread, m, addr, 0x89)?;
            m.frames.write_word(phys, addr.offset() / WORD_SIZE, val);
            thread.regs.rax = val;
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        Op::WriteByte { addr, val } => {
            let phys = guest_store(thread, m, addr, 0x88)?;
            m.frames.page_mut(phys)[addr.offset()] = val;
            thread.regs.rax = u64::from(val);
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        Op::Load { addr } => {
            let mapping = thread
                .aspace
                .table(thread.space())
                .lookup(addr)
                .ok_or(ExecError::Unmapped {
                    virt: addr.page_base(),
                })?;
            thread.regs.rax = m.frames.read_word(mapping.phys, addr.offset() / WORD_SIZE);
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        Op::Jitter { addr, val } => {
            let a = addr[run.min(1)];
            let phys = guest_store(thread, m, a, 0x89)?;
            m.frames.write_word(phys, a.offset() / WORD_SIZE, val[run.min(1)]);
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        Op::Rep { addr, count, val } => {
            if count == 0 {
                thread.regs.rip += 4;
                m.clock.retire(1);
                return Ok(OpOutcome::Retired);
            }
            let phys = guest_store(thread, m, addr, 0xf3)?;
            let word = addr.offset() / WORD_SIZE + *rep as usize;
            m.frames.write_word(phys, word, val);
            *rep += 1;
            thread.regs.rcx = u64::from(count - *rep);
            m.clock.retire(1);
            if *rep < count {
                return Ok(OpOutcome::RepContinues);
            }
            *rep = 0;
            thread.regs.rip += 4;
        }
        Op::Pio | Op::Mmio | Op::Rdtsc => {
            unreachable!("non-replayable instructions execute under supervision")
        }
    }
    Ok(OpOutcome::Retired)
}

/// Execute the non-replayable instruction once, after the element
/// around it committed.
fn execute_supervised(thread: &mut Thread, m: &mut Machine, op: Op) {
    match op {
        Op::Pio | Op::Mmio => {
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        Op::Rdtsc => {
            thread.regs.rax = m.virtual_tsc;
            m.virtual_tsc += 1;
            thread.regs.rip += 4;
            m.clock.retire(1);
        }
        other => unreachable!("{other:?} is replayable"),
    }
}

/// Run one full-speed stretch until something ends the run.
fn exec_until_stop(
    thread: &mut Thread,
    m: &mut Machine,
    wl: &Workload,
    cursor: &mut usize,
    run: usize,
    rep: &mut u32,
) -> Result<PeStop, ExecError> {
    loop {
        if *cursor >= wl.ops.len() {
            // Voluntary yield into the kernel.
            thread.pe.stop_opcode = 0x90;
            return Ok(PeStop::SendMsg);
        }
        let op = wl.ops[*cursor];
        if let Some(stop) = deterministic_stop(op) {
            thread.pe.stop_opcode = opcode_of(op);
            return Ok(stop);
        }
        match execute_op(thread, m, op, run, rep)? {
            OpOutcome::Retired => *cursor += 1,
            OpOutcome::RepContinues => {}
        }
        if m.clock.pmi_pending() {
            m.clock.take_pmi();
            // The interrupt is imprecise: a few more instructions
            // retire before delivery.
            let skid = m.config.pmi_skid[run.min(1)];
            let mut lagged = 0;
            while lagged < skid && *cursor < wl.ops.len() {
                let op = wl.ops[*cursor];
                if deterministic_stop(op).is_some() {
                    break;
                }
                match execute_op(thread, m, op, run, rep)? {
                    OpOutcome::Retired => *cursor += 1,
                    OpOutcome::RepContinues => {}
                }
                lagged += 1;
            }
            thread.pe.stop_opcode = if *rep > 0 {
                0xf3
            } else if *cursor < wl.ops.len() {
                opcode_of(wl.ops[*cursor])
            } else {
                0x90
            };
            return Ok(PeStop::Pmi);
        }
    }
}

/// Execute exactly one instruction with the trap flag set. Returns the
/// boundary stop if the cursor is already parked on one.
fn step_one(
    thread: &mut Thread,
    m: &mut Machine,
    wl: &Workload,
    cursor: &mut usize,
    run: usize,
    rep: &mut u32,
) -> Result<Option<PeStop>, ExecError> {
    if *cursor >= wl.ops.len() {
        return Ok(Some(PeStop::SendMsg));
    }
    let op = wl.ops[*cursor];
    if let Some(stop) = deterministic_stop(op) {
        return Ok(Some(stop));
    }
    match execute_op(thread, m, op, run, rep)? {
        OpOutcome::Retired => *cursor += 1,
        OpOutcome::RepContinues => {}
    }
    Ok(None)
}

fn apply_seus(
    thread: &mut Thread,
    m: &mut Machine,
    inj: &mut SeuInjector,
    outcome: &mut WorkloadOutcome,
) {
    for seu in inj.poll(thread.pe.pe_number) {
        outcome.injected += 1;
        match seu {
            Seu::ShadowBit {
                entry,
                run,
                byte,
                bit,
            } => {
                let n = thread.shadows.live_len();
                if n == 0 {
                    continue;
                }
                let id = thread.shadows.live_nth(entry % n).expect("index in range");
                let frame = thread.shadows.entry(id).shadow[run % 2];
                m.frames.page_mut(frame)[byte % PAGE_SIZE] ^= 1 << (bit % 8);
            }
            Seu::ShadowBurst {
                entry,
                run,
                byte,
                len,
            } => {
                let n = thread.shadows.live_len();
                if n == 0 {
                    continue;
                }
                let id = thread.shadows.live_nth(entry % n).expect("index in range");
                let frame = thread.shadows.entry(id).shadow[run % 2];
                let start = byte % PAGE_SIZE;
                let end = (start + len.max(1)).min(PAGE_SIZE);
                for b in &mut m.frames.page_mut(frame)[start..end] {
                    *b ^= 0xff;
                }
            }
            Seu::RegisterBit { reg, bit } => {
                let mask = 1u64 << (bit % 64);
                let r = &mut thread.regs;
                match reg % 16 {
                    0 => r.rax ^= mask,
                    1 => r.rbx ^= mask,
                    2 => r.rcx ^= mask,
                    3 => r.rdx ^= mask,
                    4 => r.rsi ^= mask,
                    5 => r.rdi ^= mask,
                    6 => r.rsp ^= mask,
                    7 => r.rbp ^= mask,
                    8 => r.r8 ^= mask,
                    9 => r.r9 ^= mask,
                    10 => r.r10 ^= mask,
                    11 => r.r11 ^= mask,
                    12 => r.r12 ^= mask,
                    13 => r.r13 ^= mask,
                    14 => r.r14 ^= mask,
                    _ => r.r15 ^= mask,
                }
            }
        }
    }
}

/// Drive one processing element to its commit. Returns the op index the
/// next element starts at, plus the REP iteration progress when the
/// element boundary fell inside a REP-prefixed instruction (the next
/// element resumes the instruction there, exactly as a mid-REP RIP with
/// a partially-consumed RCX would).
fn run_pe(
    thread: &mut Thread,
    m: &mut Machine,
    wl: &Workload,
    base: usize,
    base_rep: u32,
    injector: &mut Option<&mut SeuInjector>,
    outcome: &mut WorkloadOutcome,
) -> Result<(usize, u32), ExecError> {
    thread.start_pe(m);
    outcome.pes += 1;

    let mut cursor = [base, base];
    let mut rep = [base_rep, base_rep];
    let mut stepping = false;
    let mut run1_started = false;
    let mut pending_det: Option<PeStop> = None;

    loop {
        let decision = if stepping {
            let srun = usize::from(thread.pe.stepping_run.min(1));
            match step_one(thread, m, wl, &mut cursor[srun], srun, &mut rep[srun])? {
                Some(_boundary) => thread.on_step_boundary(m),
                None => thread.on_step(m),
            }
        } else {
            let run = usize::from(thread.pe.run_number.min(1));
            let stop = exec_until_stop(thread, m, wl, &mut cursor[run], run, &mut rep[run])?;
            pending_det = deterministic_stop_kind(stop);
            thread.check_memory(m, stop)
        };

        match decision {
            Decision::Resume => {
                stepping = false;
                if thread.pe.run_number == 1 && !run1_started {
                    run1_started = true;
                    cursor[1] = base;
                    rep[1] = base_rep;
                    // The window between the runs: exactly one run's
                    // state exists in the shadows, so a flip here is
                    // what the comparison must catch.
                    if let Some(inj) = injector.as_deref_mut() {
                        apply_seus(thread, m, inj, outcome);
                    }
                }
            }
            Decision::SingleStep => {
                stepping = true;
            }
            Decision::Committed => {
                outcome.commits += 1;
                if let Some(det) = pending_det {
                    // Both runs parked on the non-replayable
                    // instruction; it executes exactly once now.
                    let idx = cursor[0].max(cursor[1]);
                    thread.begin_supervised_step(m, det);
                    execute_supervised(thread, m, wl.ops[idx]);
                    let cleanup = thread.on_step(m);
                    debug_assert_eq!(cleanup, Decision::Committed);
                    return Ok((idx + 1, 0));
                }
                let rep_carry = if run1_started { rep[0].max(rep[1]) } else { rep[0] };
                return Ok((cursor[0].max(cursor[1]), rep_carry));
            }
            Decision::Retry => {
                outcome.retries += 1;
                cursor = [base, base];
                rep = [base_rep, base_rep];
                stepping = false;
                run1_started = false;
                pending_det = None;
            }
            Decision::SeuDetected => {
                outcome.seus += 1;
                cursor = [base, base];
                rep = [base_rep, base_rep];
                // Divergence localization replays the first run under
                // the trap flag before the real re-execution.
                stepping = true;
                run1_started = false;
                pending_det = None;
            }
        }
    }
}

fn deterministic_stop_kind(stop: PeStop) -> Option<PeStop> {
    match stop {
        PeStop::Pio | PeStop::Mmio | PeStop::Rdtsc => Some(stop),
        _ => None,
    }
}

/// Play a workload to completion, element by element.
pub fn run_workload(
    thread: &mut Thread,
    m: &mut Machine,
    wl: &Workload,
    injector: Option<&mut SeuInjector>,
) -> Result<WorkloadOutcome, ExecError> {
    let mut outcome = WorkloadOutcome::default();
    let mut injector = injector;
    let mut base = 0usize;
    let mut rep_carry = 0u32;
    while base < wl.ops.len() {
        (base, rep_carry) = run_pe(thread, m, wl, base, rep_carry, &mut injector, &mut outcome)?;
    }
    info!(
        "workload done ({}): {} elements, {} commits, {} retries, {} upsets",
        thread.name, outcome.pes, outcome.commits, outcome.retries, outcome.seus
    );
    Ok(outcome)
}
