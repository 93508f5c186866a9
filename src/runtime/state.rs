//! Shared state, threads, their stacks and call frames.
//!
//! A [`State`] owns one [`GlobalState`], which lives in a block obtained from the state's own
//! allocator and embeds the main thread. Subordinate threads are heap objects that borrow
//! the shared state; they are created with [`new_thread`] and destroyed with
//! [`free_thread`] or when the state is closed.

use std::{
    mem::{align_of, size_of},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    time::{SystemTime, UNIX_EPOCH},
};

use slotmap::{new_key_type, Key, SlotMap};

use crate::{
    gc::{
        self,
        memory::{Allocator, CountingAllocator, LBox, LVec, Memory, MAX_ALIGN},
        GcKind, GcList, GcRef, GcState, ObjectHeap, WHITE0BIT,
    },
    runtime::{
        control::ProtectMarker,
        error::{LuaError, LuaResult, Status},
        fun::{self, UpvalStore},
        keywords,
        ltype::{Variant, NUM_TAGS},
        object::{GcObject, UpvalId},
        string::{self, StringTable},
        table,
        tm::{self, TM_N},
        value::{CFunction, TValue, ThreadId},
    },
    vm::{
        lock::{NoLock, StateLock},
        options::{StateOptions, OPTIONS},
    },
};

/// Minimum number of free slots a native function gets.
pub const LUA_MINSTACK: usize = 20;
pub const BASIC_STACK_SIZE: usize = 2 * LUA_MINSTACK;
/// Slots kept above `stack_last` for metamethod calls and error handling.
pub const EXTRA_STACK: usize = 5;
pub const LUAI_MAXSTACK: usize = 1_000_000;
/// Slots granted on top of the limit to handle a stack overflow error.
pub const ERROR_STACK_EXTRA: usize = 200;
pub const ERRORSTACKSIZE: usize = LUAI_MAXSTACK + ERROR_STACK_EXTRA;

pub const LUA_RIDX_MAINTHREAD: i64 = 1;
pub const LUA_RIDX_GLOBALS: i64 = 2;
pub const LUA_RIDX_LAST: i64 = LUA_RIDX_GLOBALS;

pub const LUAI_GCPAUSE: u32 = 200;
pub const LUAI_GCMUL: u32 = 200;

new_key_type! {
    /// Handle to a call frame of a thread.
    pub struct CiId;
}

/// Continuation of a native function that yielded.
pub type KFunction = fn(&mut GlobalState, ThreadId, Status, isize) -> LuaResult<i32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HookEvent {
    Call = 0,
    Return = 1,
    Line = 2,
    Count = 3,
    TailCall = 4,
}

pub const MASK_CALL: u8 = 1 << HookEvent::Call as u8;
pub const MASK_RET: u8 = 1 << HookEvent::Return as u8;
pub const MASK_LINE: u8 = 1 << HookEvent::Line as u8;
pub const MASK_COUNT: u8 = 1 << HookEvent::Count as u8;

pub type Hook = fn(&mut GlobalState, ThreadId, HookEvent, i32);

/// Finalizer callback installed by the embedder, run for every object whose metatable has
/// a `__gc` field.
pub type Finalizer = fn(&mut GlobalState, GcRef) -> LuaResult<()>;

#[derive(Clone, Copy)]
pub enum CallKind {
    Lua {
        base: usize,
        savedpc: usize,
    },
    C {
        k: Option<KFunction>,
        old_errfunc: usize,
        ctx: isize,
    },
}

/// Activation record. Frames of a thread form a doubly linked list that is only ever grown
/// at its end.
#[derive(Clone, Copy)]
pub struct CallInfo {
    /// Stack index of the called function.
    pub func: usize,
    /// Top of the stack for this function.
    pub top: usize,
    pub previous: Option<CiId>,
    pub next: Option<CiId>,
    pub nresults: i16,
    pub callstatus: u16,
    pub extra: usize,
    pub kind: CallKind,
}

impl CallInfo {
    const fn empty() -> Self {
        Self {
            func: 0,
            top: 0,
            previous: None,
            next: None,
            nresults: 0,
            callstatus: 0,
            extra: 0,
            kind: CallKind::C {
                k: None,
                old_errfunc: 0,
                ctx: 0,
            },
        }
    }

    pub fn is_lua(&self) -> bool {
        matches!(self.kind, CallKind::Lua { .. })
    }
}

/// Per-thread state: the value stack, call frames and open upvalues.
pub struct ThreadState {
    pub(crate) status: Status,
    pub(crate) stack: LVec<TValue>,
    /// First free slot.
    pub(crate) top: usize,
    /// Last usable slot; `EXTRA_STACK` more follow it.
    pub(crate) stack_last: usize,
    pub(crate) ci: CiId,
    pub(crate) base_ci: CiId,
    pub(crate) frames: SlotMap<CiId, LBox<CallInfo>>,
    /// Number of frames besides the base one.
    pub(crate) nci: usize,
    pub(crate) openupval: Option<UpvalId>,
    pub(crate) protect: Vec<ProtectMarker>,
    pub(crate) errfunc: usize,
    /// Number of non-yieldable calls in the stack.
    pub(crate) nny: u16,
    pub(crate) nccalls: u16,
    pub(crate) hook: Option<Hook>,
    pub(crate) hookmask: u8,
    pub(crate) basehookcount: i32,
    pub(crate) hookcount: i32,
    pub(crate) allowhook: bool,
    pub(crate) oldpc: usize,
}

impl ThreadState {
    /// Thread with safe defaults and no storage. Nothing here goes through the memory
    /// manager, so a failure of the later stack allocation leaves a state that can be freed.
    pub fn preinit() -> Self {
        Self {
            status: Status::Ok,
            stack: LVec::empty(),
            top: 0,
            stack_last: 0,
            ci: CiId::null(),
            base_ci: CiId::null(),
            frames: SlotMap::with_key(),
            nci: 0,
            openupval: None,
            protect: Vec::new(),
            errfunc: 0,
            nny: 1,
            nccalls: 0,
            hook: None,
            hookmask: 0,
            basehookcount: 0,
            hookcount: 0,
            allowhook: true,
            oldpc: 0,
        }
    }

    /// Allocates the basic stack and the base frame.
    pub fn stack_init(&mut self, mem: &mut Memory) -> LuaResult<()> {
        self.stack = mem.new_vector(BASIC_STACK_SIZE, TValue::Nil)?;
        self.top = 0;
        self.stack_last = BASIC_STACK_SIZE - EXTRA_STACK;
        let base = mem.new_box(CallInfo::empty())?;
        let id = self.frames.insert(base);
        self.base_ci = id;
        self.ci = id;
        // slot of the (absent) entry function
        self.stack[self.top] = TValue::Nil;
        self.top += 1;
        self.frames[id].top = self.top + LUA_MINSTACK;
        Ok(())
    }

    pub fn free_stack(&mut self, mem: &mut Memory) {
        if !self.base_ci.is_null() {
            self.ci = self.base_ci;
            self.free_ci(mem);
            debug_assert_eq!(self.nci, 0);
            if let Some(base) = self.frames.remove(self.base_ci) {
                mem.take_box(base);
            }
            self.base_ci = CiId::null();
            self.ci = CiId::null();
        }
        mem.free_vector(&mut self.stack);
        self.top = 0;
        self.stack_last = 0;
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn stack(&self) -> &[TValue] {
        &self.stack.as_slice()[..self.top]
    }

    pub fn frame(&self) -> &CallInfo {
        &self.frames[self.ci]
    }

    pub fn frame_count(&self) -> usize {
        self.nci
    }

    pub fn reset_hook_count(&mut self) {
        self.hookcount = self.basehookcount;
    }

    pub fn hook_mask(&self) -> u8 {
        self.hookmask
    }

    pub fn hook_count(&self) -> i32 {
        self.basehookcount
    }

    /// Appends a new frame after the current one.
    pub fn extend_ci(&mut self, mem: &mut Memory) -> LuaResult<CiId> {
        debug_assert!(self.frames[self.ci].next.is_none());
        let ci = mem.new_box(CallInfo::empty())?;
        let id = self.frames.insert(ci);
        self.frames[self.ci].next = Some(id);
        self.frames[id].previous = Some(self.ci);
        self.nci += 1;
        Ok(id)
    }

    /// Makes the frame after the current one current, creating it if needed.
    pub fn next_ci(&mut self, mem: &mut Memory) -> LuaResult<CiId> {
        let id = match self.frames[self.ci].next {
            Some(next) => next,
            None => self.extend_ci(mem)?,
        };
        self.ci = id;
        Ok(id)
    }

    /// Frees every frame after the current one.
    pub fn free_ci(&mut self, mem: &mut Memory) {
        let mut next = self.frames[self.ci].next.take();
        while let Some(id) = next {
            let Some(boxed) = self.frames.remove(id) else {
                break;
            };
            next = mem.take_box(boxed).next;
            self.nci -= 1;
        }
    }

    /// Frees half of the unused frames.
    pub fn shrink_ci(&mut self, mem: &mut Memory) {
        let mut ci = self.ci;
        loop {
            let Some(next) = self.frames[ci].next else {
                break;
            };
            let Some(next2) = self.frames[next].next else {
                break;
            };
            if let Some(boxed) = self.frames.remove(next) {
                mem.take_box(boxed);
            }
            self.nci -= 1;
            self.frames[ci].next = Some(next2);
            self.frames[next2].previous = Some(ci);
            ci = next2;
        }
    }

    /// Reallocates the stack to `newsize` slots. Frames and upvalues address the stack by
    /// index, so nothing else needs fixing.
    pub fn realloc_stack(&mut self, mem: &mut Memory, newsize: usize) -> LuaResult<()> {
        debug_assert!(self.stack_last + EXTRA_STACK == self.stack.len());
        mem.resize_vector(&mut self.stack, newsize, TValue::Nil)?;
        self.stack_last = newsize - EXTRA_STACK;
        Ok(())
    }

    /// Grows the stack so that `n` more slots fit above the top, doubling it up to
    /// `max_stack` slots.
    pub fn grow_stack(&mut self, mem: &mut Memory, n: usize, max_stack: usize) -> LuaResult<()> {
        let size = self.stack.len();
        if size > max_stack {
            // already handling an overflow
            return Err(LuaError::ErrorInHandler);
        }
        let needed = self.top + n + EXTRA_STACK;
        let newsize = (2 * size).min(max_stack).max(needed);
        if newsize > max_stack {
            self.realloc_stack(mem, max_stack + ERROR_STACK_EXTRA)?;
            log::debug!(target: "state", "stack overflow at {} slots", size);
            return Err(LuaError::StackOverflow);
        }
        self.realloc_stack(mem, newsize)
    }

    #[inline]
    pub fn check_stack(&mut self, mem: &mut Memory, n: usize, max_stack: usize) -> LuaResult<()> {
        if self.stack_last.saturating_sub(self.top) <= n {
            self.grow_stack(mem, n, max_stack)?;
        }
        Ok(())
    }

    /// Pushes `v`; the caller guarantees there is room.
    #[inline]
    pub fn push(&mut self, v: TValue) {
        self.stack[self.top] = v;
        self.top += 1;
    }

    pub fn inc_top(&mut self, mem: &mut Memory, max_stack: usize) -> LuaResult<()> {
        self.check_stack(mem, 1, max_stack)?;
        self.top += 1;
        Ok(())
    }

    pub fn pop(&mut self, n: usize) {
        debug_assert!(n <= self.top);
        self.top -= n;
    }

    /// Number of slots used by the live frames.
    pub fn stack_in_use(&self) -> usize {
        let mut lim = self.top;
        let mut ci = Some(self.ci);
        while let Some(id) = ci {
            let frame = &self.frames[id];
            lim = lim.max(frame.top);
            ci = frame.previous;
        }
        lim + 1
    }

    /// Gives back unused stack and frames, e.g. after an error unwound a deep recursion.
    pub fn shrink_stack(&mut self, mem: &mut Memory, max_stack: usize) {
        let inuse = self.stack_in_use();
        let goodsize = (inuse + inuse / 8 + 2 * EXTRA_STACK).min(max_stack);
        if self.stack.len() > max_stack {
            // the frame list grew because of an overflow
            self.free_ci(mem);
        } else {
            self.shrink_ci(mem);
        }
        if inuse <= max_stack.saturating_sub(EXTRA_STACK) && goodsize < self.stack.len() {
            // shrinking never fails
            let _ = self.realloc_stack(mem, goodsize);
        }
    }
}

/// State shared by all threads of one [`State`].
pub struct GlobalState {
    pub(crate) mem: Memory,
    pub(crate) heap: ObjectHeap,
    pub(crate) upvals: UpvalStore,
    pub(crate) strt: StringTable,
    pub(crate) l_registry: TValue,
    pub(crate) seed: u32,
    pub(crate) currentwhite: u8,
    pub(crate) gcstate: GcState,
    pub(crate) gckind: GcKind,
    pub(crate) gcrunning: bool,
    pub(crate) gcpause: u32,
    pub(crate) gcstepmul: u32,
    pub(crate) max_stack: usize,
    pub(crate) mainthread: ThreadState,
    pub(crate) memerrmsg: Option<GcRef>,
    pub(crate) tmname: [Option<GcRef>; TM_N],
    /// Metatables of the basic types without per-object metatables.
    pub(crate) mt: [Option<GcRef>; NUM_TAGS],
    pub(crate) panic: Option<CFunction>,
    pub(crate) finalizer: Option<Finalizer>,
    pub(crate) lock: Box<dyn StateLock + Send>,
}

/// A thread never gets less stack than a fresh one starts with.
fn stack_limit(max_stack: usize) -> usize {
    if max_stack < BASIC_STACK_SIZE {
        log::warn!(target: "state", "stack limit {} raised to {}", max_stack, BASIC_STACK_SIZE);
        BASIC_STACK_SIZE
    } else {
        max_stack
    }
}

impl GlobalState {
    fn preinit(mem: Memory, options: &StateOptions) -> Self {
        Self {
            mem,
            heap: ObjectHeap::new(),
            upvals: SlotMap::with_key(),
            strt: StringTable::new(),
            l_registry: TValue::Nil,
            seed: 0,
            currentwhite: 1 << WHITE0BIT,
            gcstate: GcState::Pause,
            gckind: GcKind::Normal,
            gcrunning: false,
            gcpause: options.gc_pause,
            gcstepmul: options.gc_stepmul,
            max_stack: stack_limit(options.max_stack),
            mainthread: ThreadState::preinit(),
            memerrmsg: None,
            tmname: [None; TM_N],
            mt: [None; NUM_TAGS],
            panic: None,
            finalizer: None,
            lock: Box::new(NoLock),
        }
    }

    pub fn thread(&self, th: ThreadId) -> &ThreadState {
        match th {
            ThreadId::Main => &self.mainthread,
            ThreadId::Sub(r) => self.heap.thread(r),
        }
    }

    pub fn thread_mut(&mut self, th: ThreadId) -> &mut ThreadState {
        match th {
            ThreadId::Main => &mut self.mainthread,
            ThreadId::Sub(r) => self.heap.thread_mut(r),
        }
    }

    /// The thread together with the memory manager.
    pub fn split(&mut self, th: ThreadId) -> (&mut ThreadState, &mut Memory) {
        let GlobalState {
            mem,
            heap,
            mainthread,
            ..
        } = self;
        let thread = match th {
            ThreadId::Main => mainthread,
            ThreadId::Sub(r) => heap.thread_mut(r),
        };
        (thread, mem)
    }

    pub fn split_upvals(
        &mut self,
        th: ThreadId,
    ) -> (&mut ThreadState, &mut UpvalStore, &mut Memory) {
        let GlobalState {
            mem,
            heap,
            mainthread,
            upvals,
            ..
        } = self;
        let thread = match th {
            ThreadId::Main => mainthread,
            ThreadId::Sub(r) => heap.thread_mut(r),
        };
        (thread, upvals, mem)
    }

    pub fn check_stack(&mut self, th: ThreadId, n: usize) -> LuaResult<()> {
        let max_stack = self.max_stack;
        let (thread, mem) = self.split(th);
        thread.check_stack(mem, n, max_stack)
    }

    /// Pushes `v` on the stack of `th`, growing the stack if needed.
    pub fn push(&mut self, th: ThreadId, v: TValue) -> LuaResult<()> {
        gc::check_liveness(self, &v);
        self.check_stack(th, 1)?;
        self.thread_mut(th).push(v);
        Ok(())
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn objects(&self) -> &ObjectHeap {
        &self.heap
    }

    pub fn strings(&self) -> &StringTable {
        &self.strt
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn gc_params(&self) -> (u32, u32) {
        (self.gcpause, self.gcstepmul)
    }

    pub fn gc_running(&self) -> bool {
        self.gcrunning
    }

    pub fn gc_state(&self) -> GcState {
        self.gcstate
    }

    pub fn registry(&self) -> GcRef {
        self.l_registry.table()
    }

    pub fn globals(&self) -> GcRef {
        table::get_int(self, self.registry(), LUA_RIDX_GLOBALS).table()
    }

    pub fn memerrmsg(&self) -> Option<GcRef> {
        self.memerrmsg
    }

    pub fn set_finalizer(&mut self, finalizer: Option<Finalizer>) {
        self.finalizer = finalizer;
    }

    pub fn set_panic(&mut self, panic: Option<CFunction>) -> Option<CFunction> {
        std::mem::replace(&mut self.panic, panic)
    }

    pub fn set_lock(&mut self, lock: Box<dyn StateLock + Send>) {
        self.lock = lock;
    }

    /// Metatable shared by all values of a basic type.
    pub fn set_type_metatable(&mut self, variant: Variant, mt: Option<GcRef>) {
        self.mt[variant.basic() as usize] = mt;
    }

    pub fn set_hook(&mut self, th: ThreadId, hook: Option<Hook>, mask: u8, count: i32) {
        let thread = self.thread_mut(th);
        let mask = if hook.is_none() { 0 } else { mask };
        thread.hook = hook;
        thread.hookmask = mask;
        thread.basehookcount = count;
        thread.reset_hook_count();
    }
}

/// An open state. Dropping it closes the state and releases everything it holds.
pub struct State {
    g: NonNull<GlobalState>,
}

unsafe impl Send for State {}

impl State {
    /// Opens a state configured from the environment.
    pub fn new() -> LuaResult<State> {
        Self::with_options(&OPTIONS)
    }

    pub fn with_options(options: &StateOptions) -> LuaResult<State> {
        let allocator: Box<dyn Allocator + Send> = match options.memory_limit {
            Some(limit) => Box::new(CountingAllocator::with_limit(limit)),
            None => Box::new(CountingAllocator::new()),
        };
        Self::open(allocator, options)
    }

    /// Opens a state whose every block, the shared state itself included, comes from
    /// `allocator`.
    pub fn open(mut allocator: Box<dyn Allocator + Send>, options: &StateOptions) -> LuaResult<State> {
        debug_assert!(align_of::<GlobalState>() <= MAX_ALIGN);
        let size = size_of::<GlobalState>();
        let block = unsafe { allocator.realloc(None, 0, size) };
        let Some(block) = block else {
            log::error!(target: "state", "cannot allocate the shared state");
            return Err(LuaError::OutOfMemory);
        };
        let ptr = block.cast::<GlobalState>();
        unsafe {
            ptr.as_ptr()
                .write(GlobalState::preinit(Memory::new(allocator, size), options));
        }
        let mut state = State { g: ptr };
        state.seed = match options.seed {
            Some(seed) => seed,
            None => make_seed(ptr.as_ptr()),
        };
        // on failure dropping the state releases whatever was built
        open_parts(&mut state)?;
        log::debug!(target: "state", "state opened, {} bytes in use", state.mem.total_bytes());
        Ok(state)
    }
}

impl Deref for State {
    type Target = GlobalState;

    fn deref(&self) -> &GlobalState {
        unsafe { self.g.as_ref() }
    }
}

impl DerefMut for State {
    fn deref_mut(&mut self) -> &mut GlobalState {
        unsafe { self.g.as_mut() }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        close_state(self.g);
    }
}

/// Hash seed mixing the time with addresses that vary between runs.
fn make_seed(g: *const GlobalState) -> u32 {
    static ANCHOR: u8 = 0;
    let local = 0u8;
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut buf = [0u8; 32];
    buf[0..8].copy_from_slice(&time.to_ne_bytes());
    buf[8..16].copy_from_slice(&(g as usize as u64).to_ne_bytes());
    buf[16..24].copy_from_slice(&(&local as *const u8 as usize as u64).to_ne_bytes());
    buf[24..32].copy_from_slice(&(&ANCHOR as *const u8 as usize as u64).to_ne_bytes());
    string::hash(&buf, time as u32)
}

fn init_registry(g: &mut GlobalState) -> LuaResult<()> {
    let registry = table::new_table(g)?;
    g.l_registry = TValue::Table(registry);
    table::resize(g, registry, LUA_RIDX_LAST as usize, 0)?;
    table::set_int(
        g,
        registry,
        LUA_RIDX_MAINTHREAD,
        TValue::Thread(ThreadId::Main),
    )?;
    let globals = table::new_table(g)?;
    table::set_int(g, registry, LUA_RIDX_GLOBALS, TValue::Table(globals))?;
    Ok(())
}

fn open_parts(g: &mut GlobalState) -> LuaResult<()> {
    g.mainthread.stack_init(&mut g.mem)?;
    init_registry(g)?;
    string::init(g)?;
    tm::init(g)?;
    keywords::init(g)?;
    g.gcrunning = true;
    Ok(())
}

fn close_state(ptr: NonNull<GlobalState>) {
    let size = size_of::<GlobalState>();
    {
        let g = unsafe { &mut *ptr.as_ptr() };
        if !g.mainthread.stack.is_empty() {
            fun::close_upvalues(g, ThreadId::Main, 0);
        }
        gc::free_all_objects(g);
        debug_assert!(g.upvals.is_empty(), "upvalue cells outlived every closure");
        string::free_table(g);
        g.mainthread.free_stack(&mut g.mem);
        debug_assert_eq!(
            g.mem.total_bytes(),
            size,
            "memory still accounted after closing the state"
        );
        g.mem.check_accounting();
    }
    let g = unsafe { ptr.as_ptr().read() };
    let GlobalState { mem, .. } = g;
    let mut allocator = mem.into_allocator();
    unsafe {
        allocator.realloc(Some(ptr.cast()), size, 0);
    }
    log::debug!(target: "state", "state closed");
}

/// Creates a thread sharing the state of `parent`, anchored on the parent's stack.
pub fn new_thread(g: &mut GlobalState, parent: ThreadId) -> LuaResult<GcRef> {
    g.lock.lock();
    let result = new_thread_unlocked(g, parent);
    // taken just above
    unsafe { g.lock.unlock() };
    result
}

fn new_thread_unlocked(g: &mut GlobalState, parent: ThreadId) -> LuaResult<GcRef> {
    let (hookmask, basehookcount, hook) = {
        let p = g.thread(parent);
        (p.hookmask, p.basehookcount, p.hook)
    };
    let white = g.currentwhite;
    let r = g.heap.alloc_with(&mut g.mem, Variant::Thread, white, |mem| {
        let mut thread = ThreadState::preinit();
        thread.hookmask = hookmask;
        thread.basehookcount = basehookcount;
        thread.hook = hook;
        thread.reset_hook_count();
        Ok(GcObject::Thread(mem.new_box(thread)?))
    })?;
    g.push(parent, TValue::Thread(ThreadId::Sub(r)))?;
    let (thread, mem) = g.split(ThreadId::Sub(r));
    thread.stack_init(mem)?;
    log::trace!(target: "state", "thread {:?} created", r);
    Ok(r)
}

/// Destroys a subordinate thread right away. It must no longer sit on the stack of another
/// thread.
pub fn free_thread(g: &mut GlobalState, r: GcRef) {
    gc::check_reference(g, r, Variant::Thread);
    if cfg!(debug_assertions) {
        let value = TValue::Thread(ThreadId::Sub(r));
        let on_stack = |th: &ThreadState| th.stack().contains(&value);
        let mut others = g
            .heap
            .iter_list(GcList::AllGc)
            .chain(g.heap.iter_list(GcList::FinObj))
            .filter(|&t| t != r && g.heap.header(t).tag().variant() == Variant::Thread);
        assert!(
            !on_stack(&g.mainthread) && !others.any(|t| on_stack(g.heap.thread(t))),
            "thread freed while still on a stack"
        );
    }
    gc::free_object(g, r);
}

/// Releases the state of a thread already removed from the heap.
pub(crate) fn free_thread_state(g: &mut GlobalState, mut thread: LBox<ThreadState>) {
    fun::close_thread_upvalues(&mut thread, &mut g.upvals, &mut g.mem, 0);
    assert!(
        thread.openupval.is_none(),
        "thread freed with open upvalues"
    );
    thread.free_stack(&mut g.mem);
    g.mem.take_box(thread);
}
