//! Soak the double-execution core under random upset injection.
//!
//! Usage: cargo run --bin seu_soak -- [seed] [elements]

use std::env;
use tandem_core::addr::VirtAddr;
use tandem_core::attr::PageAttr;
use tandem_core::exec::{run_workload, Op, Workload};
use tandem_core::machine::{Machine, MachineConfig};
use tandem_core::paging::PageKind;
use tandem_core::thread::{Thread, ThreadKind};
use tandem_inject::injector::{InjectorConfig, SeuInjector};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let seed: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(42);
    let target_elements: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(200);

    let budget = 48;
    let mut machine = Machine::new(MachineConfig {
        frames: 256,
        budget,
        pmi_skid: [2, 0],
        ..Default::default()
    });
    let mut thread = Thread::new("soak", "pd0", ThreadKind::Native);

    for page in 0..8u64 {
        let phys = machine.frames.alloc_page().expect("arena sized above");
        thread.aspace.host.map(
            VirtAddr(0x20_0000 + page * 0x1000),
            phys,
            PageAttr::user_data().shadowed(),
            PageKind::Normal,
        );
    }

    let total_ops = (target_elements * budget) as usize;
    let ops: Vec<Op> = (0..total_ops as u64)
        .map(|i| Op::Write {
            addr: VirtAddr(0x20_0000 + (i % 8) * 0x1000 + (i % 448) / 8 * 8),
            val: i.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        })
        .collect();
    let workload = Workload::new(ops);

    let mut injector = SeuInjector::new(InjectorConfig {
        seed,
        random: true,
        random_period: 8,
        ..Default::default()
    });

    log::info!(
        "soak: seed {seed}, {} ops, budget {budget}, random injection every ~8 elements",
        workload.ops.len()
    );
    match run_workload(&mut thread, &mut machine, &workload, Some(&mut injector)) {
        Ok(outcome) => {
            log::info!(
                "survived: {} elements, {} commits, {} retries, {} detected upsets, {} injected",
                outcome.pes,
                outcome.commits,
                outcome.retries,
                outcome.seus,
                outcome.injected,
            );
            machine.counters.dump();
            if outcome.commits != outcome.pes {
                log::error!("commit deficit: {}/{}", outcome.commits, outcome.pes);
                std::process::exit(1);
            }
        }
        Err(e) => {
            log::error!("soak failed: {e}");
            std::process::exit(1);
        }
    }
}
