//! Prototypes, closures and upvalue cells.

use slotmap::SlotMap;

use crate::{
    gc::{
        self,
        memory::{LBox, Memory},
        GcRef,
    },
    runtime::{
        error::LuaResult,
        ltype::Variant,
        object::{CClosure, GcObject, LClosure, Proto, UpVal, UpvalId, UpvalSlot},
        state::{GlobalState, ThreadState},
        value::{CFunction, TValue, ThreadId},
    },
};

/// Upper bound on the upvalues of a closure.
pub const MAXUPVAL: usize = 255;

pub type UpvalStore = SlotMap<UpvalId, LBox<UpVal>>;

pub fn new_proto(g: &mut GlobalState) -> LuaResult<GcRef> {
    let white = g.currentwhite;
    g.heap.alloc(
        &mut g.mem,
        Variant::Proto,
        white,
        GcObject::Proto(Proto::default()),
    )
}

/// New Lua closure with `nupvals` empty upvalue slots.
pub fn new_lclosure(g: &mut GlobalState, nupvals: usize) -> LuaResult<GcRef> {
    let white = g.currentwhite;
    g.heap.alloc_with(&mut g.mem, Variant::LuaClosure, white, |mem| {
        Ok(GcObject::LuaClosure(LClosure {
            proto: None,
            upvals: mem.new_vector(nupvals, None)?,
        }))
    })
}

pub fn new_cclosure(g: &mut GlobalState, f: CFunction, nupvals: usize) -> LuaResult<GcRef> {
    let white = g.currentwhite;
    g.heap.alloc_with(&mut g.mem, Variant::CClosure, white, |mem| {
        Ok(GcObject::CClosure(CClosure {
            f,
            upvalue: mem.new_vector(nupvals, TValue::Nil)?,
        }))
    })
}

/// Fills every empty upvalue slot of a Lua closure with a fresh closed cell holding nil.
pub fn init_upvals(g: &mut GlobalState, cl: GcRef) -> LuaResult<()> {
    let n = g.heap.lclosure(cl).nupvalues();
    for i in 0..n {
        if g.heap.lclosure(cl).upvals[i].is_some() {
            continue;
        }
        let cell = g.mem.new_box(UpVal {
            slot: UpvalSlot::Closed(TValue::Nil),
            refcount: 1,
            open_next: None,
            touched: false,
        })?;
        let id = g.upvals.insert(cell);
        g.heap.lclosure_mut(cl).upvals[i] = Some(id);
    }
    Ok(())
}

/// Open upvalue for stack slot `level` of `th`, created if the thread has none yet. The
/// open list stays sorted by decreasing level.
pub fn find_upval(g: &mut GlobalState, th: ThreadId, level: usize) -> LuaResult<UpvalId> {
    let mut prev: Option<UpvalId> = None;
    let mut p = g.thread(th).openupval;
    while let Some(id) = p {
        let uv = &g.upvals[id];
        let Some(l) = uv.level() else {
            unreachable!("closed upvalue in the open list");
        };
        if l < level {
            break;
        }
        if l == level {
            return Ok(id);
        }
        prev = Some(id);
        p = uv.open_next;
    }

    let cell = g.mem.new_box(UpVal {
        slot: UpvalSlot::Open { thread: th, level },
        refcount: 0,
        open_next: p,
        touched: true,
    })?;
    let id = g.upvals.insert(cell);
    match prev {
        Some(prev) => g.upvals[prev].open_next = Some(id),
        None => g.thread_mut(th).openupval = Some(id),
    }
    Ok(id)
}

/// Closes the open upvalues of `thread` at or above `level`. Cells nobody references are
/// freed; the others take a copy of their stack slot.
pub fn close_thread_upvalues(
    thread: &mut ThreadState,
    upvals: &mut UpvalStore,
    mem: &mut Memory,
    level: usize,
) {
    while let Some(id) = thread.openupval {
        let uv = &mut upvals[id];
        let Some(l) = uv.level() else {
            unreachable!("closed upvalue in the open list");
        };
        if l < level {
            break;
        }
        thread.openupval = uv.open_next.take();
        if uv.refcount == 0 {
            if let Some(cell) = upvals.remove(id) {
                mem.take_box(cell);
            }
        } else {
            uv.slot = UpvalSlot::Closed(thread.stack[l]);
        }
    }
}

pub fn close_upvalues(g: &mut GlobalState, th: ThreadId, level: usize) {
    let (thread, upvals, mem) = g.split_upvals(th);
    close_thread_upvalues(thread, upvals, mem, level);
}

pub fn upval_get(g: &GlobalState, id: UpvalId) -> TValue {
    match g.upvals[id].slot {
        UpvalSlot::Open { thread, level } => g.thread(thread).stack[level],
        UpvalSlot::Closed(v) => v,
    }
}

pub fn upval_set(g: &mut GlobalState, id: UpvalId, v: TValue) {
    gc::check_liveness(g, &v);
    match g.upvals[id].slot {
        UpvalSlot::Open { thread, level } => g.thread_mut(thread).stack[level] = v,
        UpvalSlot::Closed(_) => g.upvals[id].slot = UpvalSlot::Closed(v),
    }
}

/// Adds a reference from a closure to an upvalue cell.
pub fn upval_incref(g: &mut GlobalState, id: UpvalId) {
    g.upvals[id].refcount += 1;
}

pub fn free_proto(mem: &mut Memory, p: &mut Proto) {
    mem.free_vector(&mut p.code);
    mem.free_vector(&mut p.p);
    mem.free_vector(&mut p.k);
    mem.free_vector(&mut p.lineinfo);
    mem.free_vector(&mut p.locvars);
    mem.free_vector(&mut p.upvalues);
}

/// Drops the closure's references to its cells; a closed cell nobody references anymore
/// is freed.
pub fn free_lclosure(g: &mut GlobalState, cl: &mut LClosure) {
    for i in 0..cl.upvals.len() {
        let Some(id) = cl.upvals[i] else {
            continue;
        };
        let uv = &mut g.upvals[id];
        debug_assert!(uv.refcount > 0);
        uv.refcount -= 1;
        if uv.refcount == 0 && !uv.is_open() {
            if let Some(cell) = g.upvals.remove(id) {
                g.mem.take_box(cell);
            }
        }
    }
    g.mem.free_vector(&mut cl.upvals);
}

/// Name of the `local_number`-th local variable active at instruction `pc`, if any.
pub fn local_name(p: &Proto, mut local_number: usize, pc: i32) -> Option<GcRef> {
    for var in p.locvars.iter() {
        if var.startpc > pc {
            break;
        }
        if pc < var.endpc {
            local_number -= 1;
            if local_number == 0 {
                return var.varname;
            }
        }
    }
    None
}
