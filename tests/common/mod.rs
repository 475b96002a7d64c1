#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use communicator::{CommunicatorConfig, VarSpec};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One split per section, `name.block{i}` on `ps{i}`.
pub fn var(name: &str, sections: Vec<usize>, is_sparse: bool) -> VarSpec {
    let splits = sections.len().max(1);
    VarSpec {
        name: name.to_string(),
        split_names: (0..splits).map(|i| format!("{name}.block{i}")).collect(),
        endpoints: (0..splits).map(|i| format!("ps{i}")).collect(),
        sections,
        trainer_id: 0,
        merge_add: None,
        is_sparse,
    }
}

/// Fast polling, so the tests don't wait on default intervals.
pub fn config() -> CommunicatorConfig {
    CommunicatorConfig {
        send_wait_times: 3,
        poll_interval_ms: 2,
        thread_pool_size: 2,
        ..Default::default()
    }
}

/// Polls `cond` until it holds or `TIMEOUT` elapses.
pub fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}
