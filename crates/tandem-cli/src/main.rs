use clap::{Parser, Subcommand};
use log::info;
use std::error::Error;
use tandem_kernel::{Machine, MachineConfig, SimEnv};
use tandem_user::env::{libmain, refresh_this_env};
use tandem_user::memory::layout;
use tandem_user::{
    cow_fault_handler, fork, set_pgfault_handler, thread_create, thread_join, Fork, Kernel,
    Mutex, Perm, UserMemory, VirtAddr, PAGE_SIZE,
};

const COUNTER: VirtAddr = layout::DATA_BASE.word(0);
const ITERATIONS: VirtAddr = layout::DATA_BASE.word(1);
const FORKED_VALUE: VirtAddr = layout::DATA_BASE.word(2);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Physical frames shared by all address spaces
    #[arg(long, default_value_t = 1024)]
    frames: usize,

    /// Live contexts the kernel tracks at once
    #[arg(long, default_value_t = 64)]
    contexts: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Threads incrementing a shared counter under one mutex
    Threads {
        /// Number of worker threads
        #[arg(long, default_value_t = 3)]
        workers: u32,

        /// Increments per worker
        #[arg(long, default_value_t = 20)]
        iterations: u32,
    },
    /// Fork a child and show that writes on either side stay private
    Fork,
}

fn worker(env: &SimEnv) {
    if let Err(e) = hammer(env) {
        log::error!("{}: {}", env.current_id(), e);
    }
}

fn hammer(env: &SimEnv) -> Result<(), Box<dyn Error>> {
    let mutex = Mutex::at(layout::SYNC_BASE);
    let iterations = env.load(ITERATIONS)?;
    for i in 0..iterations {
        mutex.lock(env)?;
        let count = env.load(COUNTER)?;
        // Give the others a chance to barge in while we hold the lock.
        env.yield_now();
        env.store(COUNTER, count + 1)?;
        println!("{} iteration {}: counter {}", env.current_id(), i, count + 1);
        mutex.unlock(env)?;
    }
    Ok(())
}

fn run_threads(env: &SimEnv, workers: u32, iterations: u32) -> Result<(), Box<dyn Error>> {
    refresh_this_env(env)?;
    env.alloc_region(env.current_id(), layout::DATA_BASE, PAGE_SIZE, Perm::USER_RW)?;
    env.store(ITERATIONS, iterations)?;
    Mutex::init(env, layout::SYNC_BASE)?;

    let ids = (0..workers)
        .map(|_| thread_create(env, worker))
        .collect::<Result<Vec<_>, _>>()?;
    for id in ids {
        thread_join(env, id)?;
    }
    Mutex::at(layout::SYNC_BASE).destroy(env)?;
    Ok(())
}

fn fork_demo(env: &SimEnv) {
    if let Err(e) = fork_demo_inner(env) {
        log::error!("{}: {}", env.current_id(), e);
    }
}

fn fork_demo_inner(env: &SimEnv) -> Result<(), Box<dyn Error>> {
    set_pgfault_handler(env, cow_fault_handler)?;
    // A restarted child finds the page already inherited.
    if env.page_perm(layout::DATA_BASE).is_none() {
        env.alloc_region(env.current_id(), layout::DATA_BASE, PAGE_SIZE, Perm::USER_RW)?;
        env.store(FORKED_VALUE, 100)?;
    }

    match fork(env)? {
        Fork::Parent(child) => {
            env.store(FORKED_VALUE, 150)?;
            println!("parent {}: forked {}, wrote 150", env.current_id(), child);
            env.join(child)?;
            println!(
                "parent {}: still reads {}",
                env.current_id(),
                env.load(FORKED_VALUE)?
            );
        }
        Fork::Child => {
            println!(
                "child {}: inherited {}, writing 200",
                env.current_id(),
                env.load(FORKED_VALUE)?
            );
            env.store(FORKED_VALUE, 200)?;
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let machine = Machine::new(MachineConfig {
        frame_limit: cli.frames,
        max_contexts: cli.contexts,
    });

    match cli.command {
        Commands::Threads {
            workers,
            iterations,
        } => {
            println!(
                "Starting {} workers, {} iterations each...",
                workers, iterations
            );
            let report = machine.run(move |env| {
                if let Err(e) = run_threads(env, workers, iterations) {
                    log::error!("threads: {}", e);
                }
            })?;
            let counter = machine.peek(report.root, COUNTER).unwrap_or(0);
            println!("Final counter: {} (expected {})", counter, workers * iterations);
            info!("{} run state changes requested", report.transitions.len());
        }
        Commands::Fork => {
            println!("Starting fork demo...");
            let report = machine.run(|env| libmain(env, fork_demo))?;
            for id in &report.exited {
                if let Some(value) = machine.peek(*id, FORKED_VALUE) {
                    println!("{} ends with {}", id, value);
                }
            }
        }
    }

    println!("Execution completed.");
    Ok(())
}
