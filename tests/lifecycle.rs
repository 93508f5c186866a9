use std::sync::Arc;

use lunar::gc::{memory::CountingAllocator, GcList};
use lunar::runtime::{
    error::LuaError,
    state::{free_thread, new_thread, GlobalState, HookEvent, State, BASIC_STACK_SIZE, MASK_COUNT},
    value::{TValue, ThreadId},
};
use lunar::vm::{
    lock::{MutexLock, StateLock},
    options::StateOptions,
};

#[test]
fn subordinate_thread_is_freed_before_its_parent() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let parent = new_thread(g, ThreadId::Main).unwrap();
    let parent_list = g.objects().header(parent).list();
    let objects = g.objects().list_len(GcList::AllGc);

    let total_before = g.memory().total_bytes();
    let child = new_thread(g, ThreadId::Sub(parent)).unwrap();
    let child_stack = g.thread(ThreadId::Sub(child)).stack_size();
    assert_eq!(child_stack, BASIC_STACK_SIZE);
    g.thread_mut(ThreadId::Sub(parent)).pop(1);

    let total_created = g.memory().total_bytes();
    let debt_created = g.memory().debt();
    free_thread(g, child);
    let freed = total_created - g.memory().total_bytes();

    // the debt went down by exactly what the thread held
    assert_eq!(debt_created - g.memory().debt(), freed as isize);
    assert!(freed >= child_stack * std::mem::size_of::<TValue>());
    assert_eq!(g.memory().total_bytes(), total_before);

    assert!(!g.objects().contains(child));
    assert_eq!(g.objects().header(parent).list(), parent_list);
    assert_eq!(g.objects().list_len(GcList::AllGc), objects);
    g.memory().check_accounting();
}

#[test]
fn threads_inherit_hooks() {
    fn hook(_: &mut GlobalState, _: ThreadId, _: HookEvent, _: i32) {}

    let mut state = State::new().unwrap();
    let g = &mut *state;
    g.set_hook(ThreadId::Main, Some(hook), MASK_COUNT, 10);
    let t = new_thread(g, ThreadId::Main).unwrap();
    let sub = g.thread(ThreadId::Sub(t));
    assert_eq!(sub.hook_mask(), MASK_COUNT);
    assert_eq!(sub.hook_count(), 10);
}

#[test]
fn thread_creation_takes_the_embedder_lock() {
    let lock = Arc::new(MutexLock::new());
    let mut state = State::new().unwrap();
    state.set_lock(Box::new(lock.clone()));
    let t = new_thread(&mut state, ThreadId::Main).unwrap();
    assert!(!lock.is_locked());
    // a held lock is released by its owner only
    lock.lock();
    assert!(lock.is_locked());
    unsafe { lock.unlock() };
    state.thread_mut(ThreadId::Main).pop(1);
    free_thread(&mut state, t);
}

#[test]
fn closing_releases_every_byte() {
    let options = StateOptions::default();
    let state = State::open(Box::new(CountingAllocator::new()), &options).unwrap();
    let mem = state.memory();
    assert_eq!(mem.allocator_in_use(), Some(mem.total_bytes()));
    assert!(mem.total_bytes() > mem.fixed_overhead());
    drop(state);
}

#[test]
fn opening_with_too_little_memory_fails_cleanly() {
    let mut options = StateOptions::default();
    options.set_memory_limit(1024);
    match State::with_options(&options) {
        Err(LuaError::OutOfMemory) => {}
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("a state fit in 1k"),
    }
}

#[test]
fn registry_holds_the_main_thread_and_globals() {
    let state = State::new().unwrap();
    let registry = state.registry();
    let main = lunar::runtime::table::get_int(&state, registry, 1);
    assert_eq!(main, TValue::Thread(ThreadId::Main));
    let globals = lunar::runtime::table::get_int(&state, registry, 2);
    assert_eq!(globals, TValue::Table(state.globals()));
    assert_eq!(state.thread(ThreadId::Main).top(), 1);
}
