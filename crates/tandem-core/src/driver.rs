//! The processing-element driver.
//!
//! A processing element (PE) is one bounded segment of guest or user
//! execution, run twice and compared. The driver is the state machine
//! that sits in the exception and interrupt return path: at every
//! end-of-run event it decides whether to launch the second run, step
//! one of the runs to reconcile imprecise counter readings, compare and
//! commit, or roll back and re-execute.
//!
//! All of its state lives in one per-thread bundle ([`PeState`]); a CPU
//! switching threads between runs carries the machine along with the
//! thread.
//!
//! ```text
//!   UNLAUNCHED ──start PE──▶ RUN0 ──end of run──▶ RUN1 ──end──▶ COMPARE
//!                              ▲                                   │
//!                              │ rollback                          │
//!                              └───────── DIVERGE ◀─── mismatch ───┤
//!                                                                  │
//!                                                 commit ──▶ UNLAUNCHED
//! ```

use crate::clock::PMI_OVERSHOOT_LIMIT;
use crate::machine::Machine;
use crate::regs::RegisterFile;
use crate::report::ReportCtx;
use crate::stats::TraceEntry;
use crate::thread::Thread;
use log::{error, trace, warn};

/// Extra single-step credit granted beyond the computed catch-up
/// distance. A run that cannot reconcile within the credit is handed to
/// compare, which reports the divergence.
pub const STEP_SLACK: u64 = 3;

/// Why a run ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PeStop {
    /// The retired-instruction budget elapsed.
    Pmi,
    /// A single-step trap re-entered the driver after catch-up.
    SingleStep,
    /// Page fault delivered to the native handler.
    PageFault,
    /// Port I/O instruction (non-replayable).
    Pio,
    /// Device memory access (non-replayable; device MMIO is blacklisted
    /// from the shadow path).
    Mmio,
    /// RDTSC (non-replayable).
    Rdtsc,
    /// #NM, device not available.
    DevNotAvail,
    /// #TS, invalid task segment.
    InvalidTss,
    /// #GP.
    GpFault,
    /// #AC.
    AlignCheck,
    /// #MC.
    MachineCheck,
    /// The thread yielded into the kernel (syscall preamble / IPC send).
    SendMsg,
}

/// Map an exception vector to a deterministic stop reason, if it is one.
/// Deterministic exceptions recur at the same instruction in both runs
/// and therefore make valid element boundaries.
pub fn classify_exception(vector: u8) -> Option<PeStop> {
    match vector {
        7 => Some(PeStop::DevNotAvail),
        10 => Some(PeStop::InvalidTss),
        13 => Some(PeStop::GpFault),
        17 => Some(PeStop::AlignCheck),
        18 => Some(PeStop::MachineCheck),
        _ => None,
    }
}

/// Why the trap flag is currently set.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StepReason {
    #[default]
    None,
    /// Catching the shorter run up after a PMI skid.
    Pmi,
    /// Catching up when the counter distance is within tolerance but the
    /// registers still differ.
    Equ,
    /// Localizing a confirmed divergence.
    Dbg,
    /// A non-replayable instruction executing once under supervision.
    Rdtsc,
    Pio,
    Mmio,
    Gp,
}

/// How the thread re-enters user or guest context.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LaunchState {
    #[default]
    Unlaunched,
    Iret,
    Sysexit,
    VmResume,
    VmRun,
}

/// What the embedding execution loop must do next.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Decision {
    /// Keep executing the current run at full speed.
    Resume,
    /// Execute one instruction of the stepped run, then call
    /// [`Thread::on_step`].
    SingleStep,
    /// The element committed (or had nothing to check). Start the next.
    Committed,
    /// Rolled back. Re-execute the element from its entry state.
    Retry,
    /// Divergence confirmed and counted as a detected upset; the element
    /// replays under debug stepping, then re-executes for real.
    SeuDetected,
}

/// The per-thread element state machine.
#[derive(Clone, Debug, Default)]
pub struct PeState {
    /// Current run, 0 or 1. Anything else is a driver bug.
    pub run_number: u8,
    /// Why the previous run ended.
    pub prev_reason: Option<PeStop>,
    pub step_reason: StepReason,
    pub launch_state: LaunchState,
    /// Element sequence number.
    pub pe_number: u64,

    /// Register file at element entry; both runs start from it.
    pub entry_regs: RegisterFile,
    /// End state of the peer run (the run not currently in context).
    pub peer_end_regs: RegisterFile,

    /// Raw counter readings at the end of each run.
    pub counter0: u64,
    pub counter1: u64,
    /// Exceptions taken during the current run, and the per-run records.
    pub exc_counter: u64,
    pub exc_counter0: u64,
    pub exc_counter1: u64,
    /// Canonical retired-instruction counts.
    pub first_run_instr: u64,
    pub second_run_instr: u64,
    pub distance: u64,

    /// Instructions left to single-step.
    pub nb_instr_to_execute: u64,
    /// Instructions stepped so far in this reconciliation.
    pub nb_inst_single_step: u64,
    /// Hard bound on stepping before giving up and comparing.
    pub step_credit: u64,
    /// RIP at the previous step, for REP-prefix detection.
    pub prev_rip: u64,
    /// Which run the single-stepper is advancing.
    pub stepping_run: u8,

    /// First opcode byte at the instruction the run stopped on.
    pub stop_opcode: u8,
    /// End-of-run RIP/RCX, recorded for the REP corner case.
    pub end_rip: u64,
    pub end_rcx: u64,

    /// A REP-prefixed instruction straddles the run boundary;
    /// fast-string is disabled until stepping finishes.
    pub in_rep: bool,
    /// Memory-only divergence with agreeing end reasons: the whole
    /// element is retried once before declaring an upset.
    pub in_recovery: bool,
    /// Divergence confirmed; replaying under the trap flag.
    pub in_debug: bool,
    /// The first run was stepped beyond its recorded end.
    pub first_run_advanced: bool,
}

impl Thread {
    /// Open a new processing element: migrate parked shadows back into
    /// the live set, snapshot the entry registers, and arm the
    /// instruction budget.
    pub fn start_pe(&mut self, m: &mut Machine) {
        self.pe.pe_number = m.counters.pe_total;
        m.counters.pe_total += 1;
        if self.is_vcpu() {
            m.counters.vm_pe_total += 1;
        }
        self.pe.launch_state = if self.is_vcpu() {
            LaunchState::VmResume
        } else {
            LaunchState::Iret
        };
        let pe = self.pe.pe_number;
        self.shadows
            .place_phys0(&mut m.frames, &mut self.aspace, &mut m.trace, pe);
        self.pe.entry_regs = self.regs;
        self.pe.exc_counter = 0;
        m.clock.program_pmi();
        trace!(
            "pe {} start ({}), {} carried",
            pe,
            self.name,
            self.shadows.carried()
        );
    }

    /// The driver entry point, invoked at every end-of-run event.
    pub fn check_memory(&mut self, m: &mut Machine, from: PeStop) -> Decision {
        // Nothing written, nothing carried, no recovery pending: the
        // element has no state to check and ends trivially.
        if self.shadows.live_is_empty()
            && !self.pe.in_recovery
            && !self.pe.in_debug
            && !(self.is_vcpu() && self.shadows.is_kernel_vm_modified(&m.frames))
        {
            self.pe.launch_state = LaunchState::Unlaunched;
            self.reset_pe_state(m);
            return Decision::Committed;
        }

        match self.pe.run_number {
            0 => self.end_first_run(m, from),
            1 => self.end_second_run(m, from),
            n => panic!("run_number must be 0 or 1, got {n}"),
        }
    }

    /// First run ended: flip the shadows for the second run, reload the
    /// entry registers, and rearm (or cancel) the budget.
    fn end_first_run(&mut self, m: &mut Machine, from: PeStop) -> Decision {
        self.pe.prev_reason = Some(from);
        self.pe.peer_end_regs = self.regs;
        self.pe.end_rip = self.regs.rip;
        self.pe.end_rcx = self.regs.rcx;

        if self.is_vcpu() {
            self.shadows.restore_vm_stack_state0(&mut self.aspace);
        }
        self.shadows.restore_state0(&mut self.aspace);
        self.regs = self.pe.entry_regs;

        self.pe.counter0 = m.clock.read();
        if from == PeStop::Pmi {
            self.pe.exc_counter0 = self.pe.exc_counter;
            self.pe.first_run_instr = m
                .clock
                .canonical_count(self.pe.counter0, self.pe.exc_counter0);
            if self.pe.stop_opcode == 0xf2 || self.pe.stop_opcode == 0xf3 {
                warn!(
                    "rep prefix at run boundary, rip {:#x} rcx {:#x}",
                    self.pe.end_rip, self.pe.end_rcx
                );
                self.pe.in_rep = true;
                m.fast_string = false;
            }
            if self.pe.first_run_instr > m.clock.budget() + PMI_OVERSHOOT_LIMIT {
                panic!(
                    "PMI not served early, counter {:#x}, must be dug deeper",
                    self.pe.counter0
                );
            }
            m.clock.program_pmi();
        } else {
            m.clock.cancel_pmi();
        }

        self.pe.run_number = 1;
        self.pe.exc_counter = 0;
        self.check_exit();
        Decision::Resume
    }

    /// Second run ended: reconcile instruction counts if the budget was
    /// involved, then compare and settle.
    fn end_second_run(&mut self, m: &mut Machine, from: PeStop) -> Decision {
        let pmi_involved = from == PeStop::Pmi
            || (self.pe.prev_reason == Some(PeStop::Pmi) && from != PeStop::SingleStep);
        if pmi_involved {
            if self.pe.prev_reason != Some(PeStop::Pmi) {
                // The second run overran the first into an event the
                // first never saw. A reading one past the start value
                // means the budget elapsed simultaneously with the
                // event; the interrupt is spurious and the run goes on.
                if m.clock.read() == m.clock.start_counter() + 1 {
                    self.check_exit();
                    return Decision::Resume;
                }
                warn!(
                    "run end reasons disagree: {:?} then {:?}, counter1 {:#x} counter2 {:#x}",
                    self.pe.prev_reason,
                    from,
                    self.pe.counter0,
                    m.clock.read()
                );
                m.trace.dump_log();
            }
            self.pe.exc_counter1 = self.pe.exc_counter;
            self.pe.counter1 = m.clock.read();
            m.clock.cancel_pmi();
            self.pe.second_run_instr = m
                .clock
                .canonical_count(self.pe.counter1, self.pe.exc_counter1);
            if self.pe.second_run_instr > m.clock.budget() + PMI_OVERSHOOT_LIMIT {
                panic!(
                    "PMI not served early, counter {:#x}, must be dug deeper",
                    self.pe.counter1
                );
            }
            self.pe.distance = self.pe.first_run_instr.abs_diff(self.pe.second_run_instr);

            if self.pe.distance <= 2 {
                if self.regs.diverges(&self.pe.peer_end_regs) {
                    // Within tolerance but not aligned yet: nudge the
                    // second run forward until the registers agree.
                    self.pe.nb_instr_to_execute = self.pe.distance + 1;
                    self.pe.step_credit = self.pe.nb_instr_to_execute + STEP_SLACK;
                    self.pe.nb_inst_single_step = 0;
                    self.pe.prev_rip = self.regs.rip;
                    self.pe.stepping_run = 1;
                    self.enable_step(StepReason::Equ);
                    return Decision::SingleStep;
                }
            } else if self.pe.first_run_instr > self.pe.second_run_instr {
                self.pe.nb_instr_to_execute =
                    self.pe.first_run_instr - self.pe.second_run_instr;
                self.pe.step_credit = self.pe.nb_instr_to_execute + STEP_SLACK;
                self.pe.nb_inst_single_step = 0;
                self.pe.prev_rip = self.regs.rip;
                self.pe.stepping_run = 1;
                self.enable_step(StepReason::Pmi);
                return Decision::SingleStep;
            } else {
                // The first run is the shorter one: bring its context
                // back and step it forward instead.
                self.pe.nb_instr_to_execute =
                    self.pe.second_run_instr - self.pe.first_run_instr;
                self.pe.step_credit = self.pe.nb_instr_to_execute + STEP_SLACK;
                self.pe.nb_inst_single_step = 0;
                self.switch_to_first_run();
                self.enable_step(StepReason::Pmi);
                return Decision::SingleStep;
            }
        }
        self.settle(m, from)
    }

    /// Compare the two runs and either commit or roll back.
    fn settle(&mut self, m: &mut Machine, from: PeStop) -> Decision {
        let vcpu = self.is_vcpu();
        let ctx = ReportCtx {
            domain: self.domain.clone(),
            pe_number: self.pe.pe_number,
            counter0: self.pe.counter0,
            counter1: self.pe.counter1,
            cow_faults: m.counters.cow_faults,
            pe_total: m.counters.pe_total,
            vm_pe_total: m.counters.vm_pe_total,
        };
        let reg_diff = self.regs.diverges(&self.pe.peer_end_regs);
        let mem_report = self
            .shadows
            .compare(&mut m.frames, &mut self.aspace, vcpu, &ctx);

        if mem_report.is_none() && !reg_diff {
            self.shadows
                .commit(&mut m.frames, &mut self.aspace, vcpu, &mut m.counters);
            if self.pe.in_recovery {
                m.counters.recovered += 1;
            }
            self.pe.in_recovery = false;
            self.pe.in_debug = false;
            self.pe.launch_state = LaunchState::Unlaunched;
            self.reset_pe_state(m);
            return Decision::Committed;
        }

        // Divergence. Roll the element back before deciding how loudly
        // to complain.
        m.counters.rollbacks += 1;
        if let Some(report) = &mem_report {
            error!("{report}");
            m.trace.dump_log();
        }
        if reg_diff {
            error!(
                "register divergence in pd {}: rip {:#x}/{:#x} rax {:#x}/{:#x}",
                self.domain,
                self.regs.rip,
                self.pe.peer_end_regs.rip,
                self.regs.rax,
                self.pe.peer_end_regs.rax,
            );
        }

        let localize_steps = m
            .clock
            .canonical_count(self.pe.counter0, self.pe.exc_counter0);
        self.shadows.rollback(&mut m.frames, &mut self.aspace);
        if vcpu {
            self.shadows.rollback_vm_stack(&mut m.frames, &mut self.aspace);
        }
        let same_reason = Some(from) == self.pe.prev_reason;
        let was_recovery = self.pe.in_recovery;
        self.regs = self.pe.entry_regs;
        self.disable_step(m);
        self.reset_pe_state(m);

        if same_reason && !reg_diff && !was_recovery {
            // Memory-only disagreement with agreeing end reasons: most
            // likely transient. Retry the whole element once before
            // declaring an upset.
            self.pe.in_recovery = true;
            return Decision::Retry;
        }

        self.pe.in_recovery = false;
        self.pe.in_debug = true;
        m.counters.seu_detected += 1;
        self.pe.nb_instr_to_execute = localize_steps.max(1);
        self.pe.step_credit = self.pe.nb_instr_to_execute + STEP_SLACK;
        self.pe.nb_inst_single_step = 0;
        self.pe.stepping_run = 0;
        self.enable_step(StepReason::Dbg);
        Decision::SeuDetected
    }

    /// The #DB path: one instruction was executed with the trap flag
    /// set; decide whether to keep stepping.
    pub fn on_step(&mut self, m: &mut Machine) -> Decision {
        match self.pe.step_reason {
            StepReason::Rdtsc | StepReason::Pio | StepReason::Mmio => {
                // The non-replayable instruction has now executed once
                // under supervision; the element boundary is complete.
                if !self.shadows.live_is_empty() && self.pe.step_reason != StepReason::Pio {
                    warn!(
                        "cow list not empty after {:?} step, pd {}",
                        self.pe.step_reason, self.domain
                    );
                }
                self.disable_step(m);
                self.pe.launch_state = LaunchState::Unlaunched;
                self.reset_pe_state(m);
                Decision::Committed
            }
            StepReason::Pmi => {
                m.counters.pmi_single_steps += 1;
                self.pe.nb_inst_single_step += 1;
                if self.pe.nb_instr_to_execute > 0 {
                    self.pe.nb_instr_to_execute -= 1;
                }
                if self.pe.prev_rip == self.regs.rip {
                    // REP prefix: the instruction retires many times
                    // under a single RIP and must not consume credit.
                    self.pe.nb_inst_single_step -= 1;
                    self.pe.nb_instr_to_execute += 1;
                    if !self.regs.diverges(&self.pe.peer_end_regs) {
                        return self.finish_stepping(m);
                    }
                }
                self.pe.prev_rip = self.regs.rip;
                if self.pe.step_credit > 0 {
                    self.pe.step_credit -= 1;
                } else {
                    return self.finish_stepping(m);
                }
                if self.pe.nb_instr_to_execute > 3 {
                    return Decision::SingleStep;
                }
                if !self.regs.diverges(&self.pe.peer_end_regs) {
                    self.finish_stepping(m)
                } else {
                    if self.pe.nb_instr_to_execute == 0 {
                        self.pe.nb_instr_to_execute = 1;
                    }
                    Decision::SingleStep
                }
            }
            StepReason::Equ => {
                m.counters.pmi_single_steps += 1;
                self.pe.nb_inst_single_step += 1;
                if self.pe.nb_instr_to_execute > 0 {
                    self.pe.nb_instr_to_execute -= 1;
                }
                if self.pe.prev_rip == self.regs.rip {
                    self.pe.nb_inst_single_step -= 1;
                    self.pe.nb_instr_to_execute += 1;
                    if !self.regs.diverges(&self.pe.peer_end_regs) {
                        return self.finish_stepping(m);
                    }
                }
                self.pe.prev_rip = self.regs.rip;
                if self.pe.step_credit > 0 {
                    self.pe.step_credit -= 1;
                } else {
                    return self.finish_stepping(m);
                }
                if !self.regs.diverges(&self.pe.peer_end_regs) {
                    return self.finish_stepping(m);
                }
                if self.pe.nb_instr_to_execute == 0 && !self.pe.first_run_advanced {
                    // The second run never aligned: bring the first run
                    // back and let it advance instead.
                    self.pe.nb_instr_to_execute =
                        self.pe.distance + self.pe.nb_inst_single_step + 1;
                    self.pe.step_credit = self.pe.nb_instr_to_execute + STEP_SLACK;
                    self.pe.nb_inst_single_step = 0;
                    self.switch_to_first_run();
                    self.pe.first_run_advanced = true;
                }
                Decision::SingleStep
            }
            StepReason::Dbg => {
                self.pe.nb_inst_single_step += 1;
                trace!(
                    "dbg step {} rip {:#x}",
                    self.pe.nb_inst_single_step,
                    self.regs.rip
                );
                m.trace.push(TraceEntry {
                    pe: self.pe.pe_number,
                    note: "debug step",
                    page: crate::addr::VirtAddr(self.regs.rip),
                    old_phys: crate::addr::PhysAddr(0),
                    shadow0: crate::addr::PhysAddr(0),
                    shadow1: crate::addr::PhysAddr(0),
                    twin_page: None,
                });
                if self.pe.nb_instr_to_execute > 0 {
                    self.pe.nb_instr_to_execute -= 1;
                }
                if self.pe.nb_instr_to_execute == 0 {
                    self.end_debug(m)
                } else {
                    Decision::SingleStep
                }
            }
            StepReason::Gp => Decision::SingleStep,
            StepReason::None => {
                panic!("single-step trap with no step reason")
            }
        }
    }

    /// The stepped run reached the element boundary itself: the other
    /// run ended there too, so reconciliation is as good as it gets.
    pub fn on_step_boundary(&mut self, m: &mut Machine) -> Decision {
        if self.pe.step_reason == StepReason::Dbg {
            return self.end_debug(m);
        }
        self.finish_stepping(m)
    }

    /// Begin supervised execution of a non-replayable instruction after
    /// the element around it committed.
    pub fn begin_supervised_step(&mut self, m: &mut Machine, stop: PeStop) {
        let reason = match stop {
            PeStop::Pio => {
                m.counters.pio_stops += 1;
                StepReason::Pio
            }
            PeStop::Mmio => {
                m.counters.mmio_stops += 1;
                StepReason::Mmio
            }
            PeStop::Rdtsc => {
                m.counters.rdtsc_stops += 1;
                StepReason::Rdtsc
            }
            other => panic!("{other:?} is not a supervised-step stop"),
        };
        self.enable_step(reason);
    }

    fn finish_stepping(&mut self, m: &mut Machine) -> Decision {
        self.disable_step(m);
        self.check_memory(m, PeStop::SingleStep)
    }

    fn end_debug(&mut self, m: &mut Machine) -> Decision {
        self.disable_step(m);
        self.pe.in_debug = false;
        self.pe.nb_instr_to_execute = 0;
        // Localization is over; the element now re-executes for real,
        // from its entry state, with a fresh budget.
        self.regs = self.pe.entry_regs;
        self.reset_pe_state(m);
        Decision::Retry
    }

    /// Swap the first run's end context back in and repoint the live
    /// mappings at the first shadow, so further stepping advances the
    /// first run.
    fn switch_to_first_run(&mut self) {
        std::mem::swap(&mut self.regs, &mut self.pe.peer_end_regs);
        self.shadows.restore_state1(&mut self.aspace);
        if self.is_vcpu() {
            self.shadows.restore_vm_stack_state1(&mut self.aspace);
        }
        self.pe.stepping_run = 0;
        self.pe.prev_rip = self.regs.rip;
    }

    fn enable_step(&mut self, reason: StepReason) {
        self.pe.step_reason = reason;
        self.regs.set_trap_flag();
    }

    fn disable_step(&mut self, m: &mut Machine) {
        self.pe.step_reason = StepReason::None;
        self.regs.clear_trap_flag();
        if self.pe.in_rep {
            m.fast_string = true;
            self.pe.in_rep = false;
        }
    }

    /// Validate the launch state before resuming user or guest context.
    pub fn check_exit(&self) {
        if self.pe.launch_state == LaunchState::Unlaunched {
            panic!("Bad Run launch_state {:?}", self.pe.launch_state);
        }
    }

    /// Clear the per-element bookkeeping and rearm the budget.
    fn reset_pe_state(&mut self, m: &mut Machine) {
        let pe = &mut self.pe;
        pe.run_number = 0;
        pe.prev_reason = None;
        pe.counter0 = 0;
        pe.counter1 = 0;
        pe.exc_counter = 0;
        pe.exc_counter0 = 0;
        pe.exc_counter1 = 0;
        pe.first_run_instr = 0;
        pe.second_run_instr = 0;
        pe.distance = 0;
        pe.nb_inst_single_step = 0;
        pe.step_credit = 0;
        pe.first_run_advanced = false;
        pe.stepping_run = 1;
        m.counters.reset_pe();
        m.clock.program_pmi();
    }

    /// Abort the element outright: restore mappings, destroy the live
    /// set, clear the state machine. Used on fatal faults (allocation
    /// failure) before the thread is killed.
    pub fn abort_pe(&mut self, m: &mut Machine) {
        self.shadows.cancel(&mut m.frames, &mut self.aspace);
        self.regs = self.pe.entry_regs;
        self.disable_step(m);
        self.pe.in_recovery = false;
        self.pe.in_debug = false;
        self.pe.launch_state = LaunchState::Unlaunched;
        self.reset_pe_state(m);
    }
}
