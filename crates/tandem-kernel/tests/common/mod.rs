#![allow(dead_code)]

use tandem_kernel::{Machine, MachineConfig, SimEnv};
use tandem_user::memory::layout;
use tandem_user::{Kernel, Perm, VirtAddr, PAGE_SIZE};

pub const DATA: VirtAddr = layout::DATA_BASE;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn machine() -> Machine {
    init_logging();
    Machine::new(MachineConfig::default())
}

pub fn machine_with(config: MachineConfig) -> Machine {
    init_logging();
    Machine::new(config)
}

/// Map the data page unless it is already there.
pub fn ensure_data_page(env: &SimEnv) {
    if env.page_perm(DATA).is_none() {
        env.alloc_region(env.current_id(), DATA, PAGE_SIZE, Perm::USER_RW)
            .expect("data page");
    }
}

pub fn slot(index: u32) -> VirtAddr {
    DATA.word(index)
}
