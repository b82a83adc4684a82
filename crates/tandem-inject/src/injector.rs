//! The seeded injection engine.
//!
//! The execution loop polls the injector once per processing element,
//! between the two runs — the window where a flip lands in exactly one
//! run's state and must be caught by the comparison.

use crate::faults::Seu;
use crate::schedule::SeuSchedule;
use log::debug;
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Configuration for the injector.
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Master seed. Identical seeds reproduce identical campaigns.
    pub seed: u64,
    /// Pre-built schedule of pinned upsets.
    pub schedule: Option<SeuSchedule>,
    /// Also generate random upsets.
    pub random: bool,
    /// Mean interval between random upsets, in elements.
    pub random_period: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        InjectorConfig {
            seed: 42,
            schedule: None,
            random: false,
            random_period: 16,
        }
    }
}

/// Deterministic upset generator.
pub struct SeuInjector {
    rng: ChaCha20Rng,
    schedule: SeuSchedule,
    random: bool,
    random_period: u64,
    injected: u64,
}

impl SeuInjector {
    pub fn new(config: InjectorConfig) -> Self {
        let mut key = [0u8; 32];
        // Domain-separated seed so the injector stream never collides
        // with other consumers of the same master seed.
        let derived = config.seed.wrapping_add(0x5345_5530); // "SEU0"
        key[..8].copy_from_slice(&derived.to_le_bytes());
        SeuInjector {
            rng: ChaCha20Rng::from_seed(key),
            schedule: config.schedule.unwrap_or_default(),
            random: config.random,
            random_period: config.random_period.max(1),
            injected: 0,
        }
    }

    /// Upsets to apply between the runs of element `pe`.
    pub fn poll(&mut self, pe: u64) -> Vec<Seu> {
        let mut due = self.schedule.due(pe);
        if self.random && self.rng.next_u64() % self.random_period == 0 {
            due.push(self.random_seu());
        }
        for seu in &due {
            debug!("injecting {seu} at pe {pe}");
        }
        self.injected += due.len() as u64;
        due
    }

    /// Total upsets handed out.
    #[inline]
    pub fn injected(&self) -> u64 {
        self.injected
    }

    fn random_seu(&mut self) -> Seu {
        match self.rng.next_u64() % 3 {
            0 => Seu::ShadowBit {
                entry: (self.rng.next_u64() % 64) as usize,
                run: (self.rng.next_u64() % 2) as usize,
                byte: (self.rng.next_u64() % 4096) as usize,
                bit: (self.rng.next_u64() % 8) as u8,
            },
            1 => Seu::ShadowBurst {
                entry: (self.rng.next_u64() % 64) as usize,
                run: (self.rng.next_u64() % 2) as usize,
                byte: (self.rng.next_u64() % 3840) as usize,
                len: 64 + (self.rng.next_u64() % 192) as usize,
            },
            _ => Seu::RegisterBit {
                reg: (self.rng.next_u64() % 16) as usize,
                bit: (self.rng.next_u64() % 64) as u8,
            },
        }
    }
}
