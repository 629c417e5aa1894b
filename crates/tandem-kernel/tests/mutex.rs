mod common;

use common::{ensure_data_page, machine, machine_with, slot};
use tandem_kernel::{MachineConfig, SimEnv};
use tandem_user::memory::layout;
use tandem_user::{
    thread_create, thread_join, Kernel, KernelError, Mutex, SyncError, UserMemory,
};

const ITERATIONS: u32 = 20;

const COUNTER: u32 = 0;
const INSIDE: u32 = 1;
const OVERLAPS: u32 = 2;
const ORDER_LEN: u32 = 3;
const ORDER: u32 = 4;

fn bump(env: &SimEnv, index: u32) {
    let value = env.load(slot(index)).unwrap();
    env.store(slot(index), value + 1).unwrap();
}

fn hammer(env: &SimEnv) {
    let mutex = Mutex::at(layout::SYNC_BASE);
    let me = env.current_id().val();
    for _ in 0..ITERATIONS {
        mutex.lock(env).unwrap();
        if env.load(slot(INSIDE)).unwrap() != 0 {
            bump(env, OVERLAPS);
        }
        env.store(slot(INSIDE), me).unwrap();

        let seen = env.load(slot(COUNTER)).unwrap();
        env.yield_now();
        if env.load(slot(INSIDE)).unwrap() != me {
            bump(env, OVERLAPS);
        }
        env.store(slot(COUNTER), seen + 1).unwrap();

        env.store(slot(INSIDE), 0).unwrap();
        mutex.unlock(env).unwrap();
    }
}

#[test]
fn three_threads_never_lose_an_increment() {
    let machine = machine();
    let report = machine
        .run(|env| {
            ensure_data_page(env);
            Mutex::init(env, layout::SYNC_BASE).unwrap();
            let workers: Vec<_> = (0..3).map(|_| thread_create(env, hammer).unwrap()).collect();
            for id in workers {
                thread_join(env, id).unwrap();
            }
        })
        .unwrap();

    assert_eq!(machine.peek(report.root, slot(COUNTER)), Some(3 * ITERATIONS));
    assert_eq!(machine.peek(report.root, slot(OVERLAPS)), Some(0));
    assert_eq!(report.exited.len(), 4);
}

fn record_arrival(env: &SimEnv) {
    let mutex = Mutex::at(layout::SYNC_BASE);
    mutex.lock(env).unwrap();
    let n = env.load(slot(ORDER_LEN)).unwrap();
    env.store(slot(ORDER + n), env.current_id().val()).unwrap();
    env.store(slot(ORDER_LEN), n + 1).unwrap();
    mutex.unlock(env).unwrap();
}

#[test]
fn waiters_acquire_in_arrival_order() {
    let machine = machine();
    let report = machine
        .run(|env| {
            ensure_data_page(env);
            let mutex = Mutex::init(env, layout::SYNC_BASE).unwrap();
            mutex.lock(env).unwrap();

            let waiters: Vec<_> = (0..3)
                .map(|_| thread_create(env, record_arrival).unwrap())
                .collect();
            // Each waiter runs once and parks on the mutex.
            env.yield_now();
            assert_eq!(mutex.queue().len(env).unwrap(), 3);

            mutex.unlock(env).unwrap();
            // A newcomer queues behind everyone already waiting.
            record_arrival(env);

            for id in &waiters {
                thread_join(env, *id).unwrap();
            }
            let order: Vec<u32> = (0..4)
                .map(|i| env.load(slot(ORDER + i)).unwrap())
                .collect();
            let mut expected: Vec<u32> = waiters.iter().map(|id| id.val()).collect();
            expected.push(env.current_id().val());
            assert_eq!(order, expected);
        })
        .unwrap();

    assert_eq!(report.exited.len(), 4);
}

const DESTROYED: u32 = 10;
const ACQUIRED: u32 = 11;

fn wait_for_destroy(env: &SimEnv) {
    match Mutex::at(layout::SYNC_BASE).lock(env) {
        Err(SyncError::Destroyed) => bump(env, DESTROYED),
        Ok(()) => bump(env, ACQUIRED),
        Err(e) => panic!("unexpected lock failure: {}", e),
    }
}

#[test]
fn destroy_wakes_each_waiter_exactly_once() {
    let machine = machine();
    let report = machine
        .run(|env| {
            ensure_data_page(env);
            let mutex = Mutex::init(env, layout::SYNC_BASE).unwrap();
            mutex.lock(env).unwrap();
            let waiters: Vec<_> = (0..3)
                .map(|_| thread_create(env, wait_for_destroy).unwrap())
                .collect();
            env.yield_now();

            assert_eq!(mutex.destroy(env).unwrap(), 3);
            assert_eq!(env.page_perm(layout::SYNC_BASE), None);
            for id in waiters {
                thread_join(env, id).unwrap();
            }
        })
        .unwrap();

    assert_eq!(machine.peek(report.root, slot(DESTROYED)), Some(3));
    assert_eq!(machine.peek(report.root, slot(ACQUIRED)), Some(0));
    let waiters: Vec<_> = report
        .exited
        .iter()
        .copied()
        .filter(|id| *id != report.root)
        .collect();
    assert_eq!(waiters.len(), 3);
    for id in waiters {
        assert_eq!(report.wakeups(id), 1);
    }
}

fn try_foreign_unlock(env: &SimEnv) {
    let result = Mutex::at(layout::SYNC_BASE).unlock(env);
    assert_eq!(
        result,
        Err(SyncError::NotOwner {
            caller: env.current_id()
        })
    );
    bump(env, ACQUIRED);
}

#[test]
fn only_the_owner_can_unlock() {
    let machine = machine();
    let report = machine
        .run(|env| {
            ensure_data_page(env);
            let mutex = Mutex::init(env, layout::SYNC_BASE).unwrap();
            assert!(matches!(
                mutex.unlock(env),
                Err(SyncError::NotOwner { .. })
            ));

            mutex.lock(env).unwrap();
            let other = thread_create(env, try_foreign_unlock).unwrap();
            thread_join(env, other).unwrap();
            assert_eq!(mutex.owner(env).unwrap(), Some(env.current_id()));
            mutex.unlock(env).unwrap();
        })
        .unwrap();

    assert_eq!(machine.peek(report.root, slot(ACQUIRED)), Some(1));
}

#[test]
fn init_reports_missing_storage() {
    let machine = machine_with(MachineConfig {
        frame_limit: 1,
        ..MachineConfig::default()
    });
    machine
        .run(|env| {
            assert_eq!(
                Mutex::init(env, layout::SYNC_BASE),
                Err(SyncError::Storage {
                    base: layout::SYNC_BASE,
                    source: KernelError::NoMemory
                })
            );
        })
        .unwrap();
}
