//! Inject one upset into a double-executed workload and watch the core
//! mask it.
//!
//! Usage: cargo run --bin seu_demo

use tandem_core::addr::VirtAddr;
use tandem_core::attr::PageAttr;
use tandem_core::exec::{run_workload, Op, Workload};
use tandem_core::machine::{Machine, MachineConfig};
use tandem_core::paging::PageKind;
use tandem_core::thread::{Thread, ThreadKind};
use tandem_inject::faults::Seu;
use tandem_inject::injector::{InjectorConfig, SeuInjector};
use tandem_inject::schedule::SeuScheduleBuilder;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut machine = Machine::new(MachineConfig {
        frames: 128,
        budget: 64,
        ..Default::default()
    });
    let mut thread = Thread::new("demo", "pd0", ThreadKind::Native);

    for page in 0..4u64 {
        let phys = machine.frames.alloc_page().expect("arena sized above");
        thread.aspace.host.map(
            VirtAddr(0x10_0000 + page * 0x1000),
            phys,
            PageAttr::user_data().shadowed(),
            PageKind::Normal,
        );
    }

    let ops: Vec<Op> = (0..200)
        .map(|i| Op::Write {
            addr: VirtAddr(0x10_0000 + (i % 4) * 0x1000 + (i % 64) * 8),
            val: i * 31,
        })
        .collect();
    let workload = Workload::new(ops);

    // One bit flip in a first-run shadow, between the runs of the first
    // element.
    let schedule = SeuScheduleBuilder::new()
        .at_pe(
            0,
            Seu::ShadowBit {
                entry: 0,
                run: 0,
                byte: 17,
                bit: 3,
            },
        )
        .build();
    let mut injector = SeuInjector::new(InjectorConfig {
        seed: 42,
        schedule: Some(schedule),
        ..Default::default()
    });

    log::info!("running {} ops with one scheduled upset", workload.ops.len());
    match run_workload(&mut thread, &mut machine, &workload, Some(&mut injector)) {
        Ok(outcome) => {
            log::info!(
                "masked: {} elements, {} commits, {} retries, {} upsets injected",
                outcome.pes,
                outcome.commits,
                outcome.retries,
                outcome.injected,
            );
            machine.counters.dump();
        }
        Err(e) => log::error!("workload failed: {e}"),
    }
}
