use jumphash::JumpHasher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strum_macros::{Display, EnumIter, EnumString};
use weighted_rs::{SmoothWeight, Weight};

#[derive(Debug, Copy, Clone, Display, PartialEq, EnumIter, EnumString)]
pub enum SelectMode {
    //RandomSelect is selecting randomly
    RandomSelect = 0,
    //RoundRobin is selecting by round robin
    RoundRobin = 1,
    //WeightedRoundRobin is selecting by weighted round robin
    WeightedRoundRobin = 2,
    //ConsistentHash is selecting by hashing the route
    ConsistentHash = 3,
}

/// a connected, dispatchable endpoint at selection time.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub addr: String,
    pub weight: i32,
}

/// load-balancing policy over the connected candidates of one service.
/// `route` is the `path.method` of the call, for hash-based policies.
pub trait Selector: Send {
    fn select(&mut self, route: &str, candidates: &[Candidate]) -> Option<String>;
}

pub fn new_selector(mode: SelectMode) -> Box<dyn Selector> {
    match mode {
        SelectMode::RandomSelect => Box::new(RandomSelector::new()),
        SelectMode::RoundRobin => Box::new(RoundRobinSelector::new()),
        SelectMode::WeightedRoundRobin => Box::new(WeightedRoundRobinSelector::new()),
        SelectMode::ConsistentHash => Box::new(ConsistentHashSelector::new()),
    }
}

pub struct RandomSelector {
    rnd: StdRng,
}

impl RandomSelector {
    pub fn new() -> Self {
        RandomSelector {
            rnd: StdRng::from_entropy(),
        }
    }
}

impl Selector for RandomSelector {
    fn select(&mut self, _route: &str, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rnd.gen_range(0..candidates.len());
        Some(candidates[idx].addr.clone())
    }
}

pub struct RoundRobinSelector {
    i: usize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        RoundRobinSelector { i: 0 }
    }
}

impl Selector for RoundRobinSelector {
    fn select(&mut self, _route: &str, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let addr = candidates[self.i % candidates.len()].addr.clone();
        self.i = self.i.wrapping_add(1);
        Some(addr)
    }
}

pub struct WeightedRoundRobinSelector {
    members: Vec<Candidate>,
    weight: SmoothWeight<String>,
}

impl WeightedRoundRobinSelector {
    pub fn new() -> Self {
        WeightedRoundRobinSelector {
            members: Vec::new(),
            weight: SmoothWeight::new(),
        }
    }
}

impl Selector for WeightedRoundRobinSelector {
    fn select(&mut self, _route: &str, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        if self.members.as_slice() != candidates {
            self.members = candidates.to_vec();
            self.weight = SmoothWeight::new();
            for c in candidates {
                self.weight.add(c.addr.clone(), c.weight as isize);
            }
        }
        self.weight.next()
    }
}

pub struct ConsistentHashSelector {
    hasher: JumpHasher,
}

impl ConsistentHashSelector {
    pub fn new() -> Self {
        ConsistentHashSelector {
            hasher: JumpHasher::new(),
        }
    }
}

impl Selector for ConsistentHashSelector {
    fn select(&mut self, route: &str, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let slot = self.hasher.slot(&route, candidates.len() as u32) as usize;
        Some(candidates[slot].addr.clone())
    }
}
