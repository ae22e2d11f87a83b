use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// per-second dispatch counter; retains the last five seconds only.
#[derive(Default)]
pub struct QpsCounter {
    slots: Mutex<HashMap<u64, u64>>,
}

impl QpsCounter {
    pub fn new() -> QpsCounter {
        Default::default()
    }

    fn current_second() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn increment(&self) {
        let cs = Self::current_second();
        let mut slots = self.slots.lock().unwrap();
        *slots.entry(cs).or_insert(0) += 1;
        slots.retain(|&second, _| second + 5 >= cs);
    }

    /// requests counted during the last full second.
    pub fn qps(&self) -> u64 {
        let cs = Self::current_second();
        let slots = self.slots.lock().unwrap();
        slots.get(&cs.saturating_sub(1)).copied().unwrap_or(0)
    }
}
