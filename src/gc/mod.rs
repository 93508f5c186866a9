//! Object heap and collector bookkeeping.
//!
//! Objects live in a generation-checked arena; a stale [`GcRef`] never aliases a newer object.
//! Each object is a member of exactly one [`GcList`], recorded in its header together with the
//! neighbouring handles of that list. Only list membership, colours and the memory accounting
//! are handled here; tracing is left to the collector proper.

use slotmap::{new_key_type, SlotMap};

use crate::runtime::{
    error::LuaResult,
    fun,
    ltype::{LuaType, Variant},
    object::GcObject,
    state::{self, GlobalState},
    string, table, tm,
    value::TValue,
};

use self::memory::{LBox, Memory};

pub mod memory;

new_key_type! {
    /// Handle to a collected heap object.
    pub struct GcRef;
}

/// Object lists. Every heap object belongs to exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GcList {
    /// Ordinary collectable objects.
    AllGc = 0,
    /// Objects with a finalizer that are not yet ready to be finalized.
    FinObj = 1,
    /// Objects whose finalizer should run.
    ToBeFnz = 2,
    /// Objects that are never collected.
    FixedGc = 3,
}

pub const GC_LISTS: [GcList; 4] = [GcList::AllGc, GcList::FinObj, GcList::ToBeFnz, GcList::FixedGc];

pub const WHITE0BIT: u8 = 0;
pub const WHITE1BIT: u8 = 1;
pub const BLACKBIT: u8 = 2;
/// Object has been marked for finalization.
pub const FINALIZEDBIT: u8 = 3;

pub const WHITEBITS: u8 = (1 << WHITE0BIT) | (1 << WHITE1BIT);

#[inline(always)]
pub const fn is_white(marked: u8) -> bool {
    marked & WHITEBITS != 0
}

#[inline(always)]
pub const fn is_black(marked: u8) -> bool {
    marked & (1 << BLACKBIT) != 0
}

#[inline(always)]
pub const fn is_gray(marked: u8) -> bool {
    !is_white(marked) && !is_black(marked)
}

#[inline(always)]
pub const fn other_white(current_white: u8) -> u8 {
    current_white ^ WHITEBITS
}

#[inline(always)]
pub const fn is_dead(current_white: u8, marked: u8) -> bool {
    marked & other_white(current_white) & WHITEBITS != 0
}

#[inline(always)]
pub const fn to_finalize(marked: u8) -> bool {
    marked & (1 << FINALIZEDBIT) != 0
}

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Propagate,
    Atomic,
    SweepAllGc,
    SweepFinObj,
    SweepToBeFnz,
    SweepEnd,
    CallFin,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Normal,
    Emergency,
}

pub struct GcHeader {
    pub(crate) tt: LuaType,
    pub(crate) marked: u8,
    pub(crate) list: GcList,
    prev: Option<GcRef>,
    next: Option<GcRef>,
}

impl GcHeader {
    pub fn tag(&self) -> LuaType {
        self.tt
    }

    pub fn marked(&self) -> u8 {
        self.marked
    }

    pub fn list(&self) -> GcList {
        self.list
    }
}

pub struct GcBox {
    pub(crate) header: GcHeader,
    pub(crate) body: GcObject,
}

#[derive(Default, Clone, Copy)]
struct ListEnds {
    head: Option<GcRef>,
    tail: Option<GcRef>,
    len: usize,
}

pub struct ObjectHeap {
    objects: SlotMap<GcRef, LBox<GcBox>>,
    lists: [ListEnds; 4],
}

#[cold]
#[inline(never)]
fn dangling(r: GcRef) -> ! {
    panic!("dangling heap reference {:?}", r)
}

#[cold]
#[inline(never)]
fn wrong_kind(wanted: &str, found: LuaType) -> ! {
    panic!("expected a {} object, found {:?}", wanted, found)
}

macro_rules! typed_accessors {
    ($($name: ident: $ty: ty),*) => {
        paste::paste! {
            impl ObjectHeap {
                $(
                    #[inline]
                    pub fn $name(&self, r: GcRef) -> &$ty {
                        let gc = self.get_box(r);
                        match gc.body.[<as_ $name>]() {
                            Some(x) => x,
                            None => wrong_kind(stringify!($name), gc.header.tt),
                        }
                    }

                    #[inline]
                    pub fn [<$name _mut>](&mut self, r: GcRef) -> &mut $ty {
                        let gc = self.get_box_mut(r);
                        let tt = gc.header.tt;
                        match gc.body.[<as_ $name _mut>]() {
                            Some(x) => x,
                            None => wrong_kind(stringify!($name), tt),
                        }
                    }
                )*
            }
        }
    };
}

typed_accessors!(
    string: crate::runtime::object::LString,
    udata: crate::runtime::object::Udata,
    table: crate::runtime::object::Table,
    proto: crate::runtime::object::Proto,
    lclosure: crate::runtime::object::LClosure,
    cclosure: crate::runtime::object::CClosure,
    thread: crate::runtime::state::ThreadState
);

impl ObjectHeap {
    pub fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
            lists: [ListEnds::default(); 4],
        }
    }

    /// Allocates a new object and links it at the head of the all-objects list.
    pub fn alloc(
        &mut self,
        mem: &mut Memory,
        variant: Variant,
        white: u8,
        body: GcObject,
    ) -> LuaResult<GcRef> {
        self.alloc_with(mem, variant, white, |_| Ok(body))
    }

    /// Like [`ObjectHeap::alloc`], building the body only once the object record is allocated.
    /// If `build` fails the record is released and nothing is linked.
    pub fn alloc_with(
        &mut self,
        mem: &mut Memory,
        variant: Variant,
        white: u8,
        build: impl FnOnce(&mut Memory) -> LuaResult<GcObject>,
    ) -> LuaResult<GcRef> {
        let slot = mem.reserve_box::<GcBox>()?;
        let body = match build(mem) {
            Ok(body) => body,
            Err(err) => {
                mem.release_slot(slot);
                return Err(err);
            }
        };
        let boxed = slot.fill(GcBox {
            header: GcHeader {
                tt: LuaType::heap(variant),
                marked: white & WHITEBITS,
                list: GcList::AllGc,
                prev: None,
                next: None,
            },
            body,
        });
        let r = self.objects.insert(boxed);
        self.link_first(r, GcList::AllGc);
        Ok(r)
    }

    #[inline]
    pub fn contains(&self, r: GcRef) -> bool {
        self.objects.contains_key(r)
    }

    pub fn get(&self, r: GcRef) -> Option<&GcBox> {
        self.objects.get(r).map(|b| &**b)
    }

    #[inline]
    fn get_box(&self, r: GcRef) -> &GcBox {
        match self.objects.get(r) {
            Some(b) => &**b,
            None => dangling(r),
        }
    }

    #[inline]
    fn get_box_mut(&mut self, r: GcRef) -> &mut GcBox {
        match self.objects.get_mut(r) {
            Some(b) => &mut **b,
            None => dangling(r),
        }
    }

    #[inline]
    pub fn header(&self, r: GcRef) -> &GcHeader {
        &self.get_box(r).header
    }

    #[inline]
    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        &mut self.get_box_mut(r).header
    }

    #[inline]
    pub fn object(&self, r: GcRef) -> &GcObject {
        &self.get_box(r).body
    }

    #[inline]
    pub fn object_mut(&mut self, r: GcRef) -> &mut GcObject {
        &mut self.get_box_mut(r).body
    }

    /// Number of live objects in all lists.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn list_len(&self, list: GcList) -> usize {
        self.lists[list as usize].len
    }

    pub fn first(&self, list: GcList) -> Option<GcRef> {
        self.lists[list as usize].head
    }

    /// Walks `list` from its head (most recently linked object first).
    pub fn iter_list(&self, list: GcList) -> ListIter<'_> {
        ListIter {
            heap: self,
            cursor: self.first(list),
        }
    }

    fn link_first(&mut self, r: GcRef, list: GcList) {
        let old_head = self.lists[list as usize].head;
        {
            let header = self.header_mut(r);
            header.list = list;
            header.prev = None;
            header.next = old_head;
        }
        match old_head {
            Some(head) => self.header_mut(head).prev = Some(r),
            None => self.lists[list as usize].tail = Some(r),
        }
        let ends = &mut self.lists[list as usize];
        ends.head = Some(r);
        ends.len += 1;
    }

    fn link_last(&mut self, r: GcRef, list: GcList) {
        let old_tail = self.lists[list as usize].tail;
        {
            let header = self.header_mut(r);
            header.list = list;
            header.prev = old_tail;
            header.next = None;
        }
        match old_tail {
            Some(tail) => self.header_mut(tail).next = Some(r),
            None => self.lists[list as usize].head = Some(r),
        }
        let ends = &mut self.lists[list as usize];
        ends.tail = Some(r);
        ends.len += 1;
    }

    fn unlink(&mut self, r: GcRef) {
        let (list, prev, next) = {
            let header = self.header_mut(r);
            (header.list, header.prev.take(), header.next.take())
        };
        match prev {
            Some(prev) => self.header_mut(prev).next = next,
            None => self.lists[list as usize].head = next,
        }
        match next {
            Some(next) => self.header_mut(next).prev = prev,
            None => self.lists[list as usize].tail = prev,
        }
        self.lists[list as usize].len -= 1;
    }

    /// Moves `r` to the head of `list`.
    pub fn move_to(&mut self, r: GcRef, list: GcList) {
        self.unlink(r);
        self.link_first(r, list);
    }

    /// Moves `r` to the end of `list`.
    pub fn move_to_end(&mut self, r: GcRef, list: GcList) {
        self.unlink(r);
        self.link_last(r, list);
    }

    /// Unlinks and releases the object's record, giving its body back so that the caller can
    /// release what the body owns.
    pub fn remove(&mut self, mem: &mut Memory, r: GcRef) -> GcObject {
        self.unlink(r);
        match self.objects.remove(r) {
            Some(boxed) => mem.take_box(boxed).body,
            None => dangling(r),
        }
    }
}

impl Default for ObjectHeap {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ListIter<'a> {
    heap: &'a ObjectHeap,
    cursor: Option<GcRef>,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = GcRef;

    fn next(&mut self) -> Option<GcRef> {
        let r = self.cursor?;
        self.cursor = self.heap.header(r).next;
        Some(r)
    }
}

/// Consistency check for a value about to be stored: a heap value's tag must agree with the
/// referenced object and the object must not be dead.
pub fn check_liveness(g: &GlobalState, v: &TValue) {
    if !cfg!(debug_assertions) {
        return;
    }
    if let TValue::DeadKey(_) = v {
        return;
    }
    if let Some(r) = v.gc_ref() {
        check_reference(g, r, v.tag().variant());
    }
}

/// Same check for a bare reference expected to point at a `variant` object.
pub fn check_reference(g: &GlobalState, r: GcRef, variant: Variant) {
    if !cfg!(debug_assertions) {
        return;
    }
    let Some(gc) = g.heap.get(r) else {
        panic!("{:?} reference {:?} points to a freed object", variant, r);
    };
    assert_eq!(
        gc.header.tt.variant(),
        variant,
        "reference tag does not match the object it points to"
    );
    assert!(
        !is_dead(g.currentwhite, gc.header.marked),
        "reference {:?} points to a dead object",
        r
    );
}

/// Moves an object from the all-objects list to the never-collected list. It must be the
/// most recently created object.
pub fn fix(g: &mut GlobalState, r: GcRef) {
    assert_eq!(
        g.heap.first(GcList::AllGc),
        Some(r),
        "only the newest object can be fixed"
    );
    let header = g.heap.header_mut(r);
    // gray forever
    header.marked &= !(WHITEBITS | (1 << BLACKBIT));
    g.heap.move_to(r, GcList::FixedGc);
}

/// If the metatable `mt` asks for finalization, moves `r` from the all-objects list to the
/// pending-finalization list.
pub fn check_finalizer(g: &mut GlobalState, r: GcRef, mt: Option<GcRef>) {
    let marked = g.heap.header(r).marked;
    if to_finalize(marked) || g.gckind == GcKind::Emergency {
        return;
    }
    let Some(mt) = mt else {
        return;
    };
    if tm::fast_tm(g, mt, tm::TMS::Gc).is_none() {
        return;
    }
    log::trace!(target: "gc", "{:?} marked for finalization", r);
    g.heap.move_to(r, GcList::FinObj);
    g.heap.header_mut(r).marked |= 1 << FINALIZEDBIT;
}

/// Moves objects with finalizers to the ready-to-finalize list, keeping their order. With
/// `all` every pending object is moved, otherwise only unreached (white) ones.
pub fn separate_tobefnz(g: &mut GlobalState, all: bool) {
    let pending: Vec<GcRef> = g.heap.iter_list(GcList::FinObj).collect();
    // newest first, like the pending list
    for r in pending {
        let marked = g.heap.header(r).marked;
        if all || is_white(marked) {
            g.heap.move_to_end(r, GcList::ToBeFnz);
        }
    }
}

/// Runs the embedder's finalizer hook for every object in the ready-to-finalize list. Each
/// object goes back to the all-objects list before its finalizer runs.
pub fn call_all_pending_finalizers(g: &mut GlobalState) {
    while let Some(r) = g.heap.first(GcList::ToBeFnz) {
        g.heap.move_to(r, GcList::AllGc);
        g.heap.header_mut(r).marked &= !(1 << FINALIZEDBIT);
        if let Some(hook) = g.finalizer {
            if let Err(err) = hook(g, r) {
                log::warn!(target: "gc", "error in finalizer of {:?}: {}", r, err);
            }
        }
    }
}

/// Releases one object and whatever it owns.
pub fn free_object(g: &mut GlobalState, r: GcRef) {
    if g.heap.header(r).tt.variant() == Variant::ShortString {
        string::remove(g, r);
    }
    let body = g.heap.remove(&mut g.mem, r);
    match body {
        GcObject::String(mut s) => g.mem.free_vector(&mut s.contents),
        GcObject::UserData(mut u) => g.mem.free_vector(&mut u.data),
        GcObject::Table(mut t) => table::free(&mut g.mem, &mut t),
        GcObject::Proto(mut p) => fun::free_proto(&mut g.mem, &mut p),
        GcObject::LuaClosure(mut cl) => fun::free_lclosure(g, &mut cl),
        GcObject::CClosure(mut cl) => g.mem.free_vector(&mut cl.upvalue),
        GcObject::Thread(th) => state::free_thread_state(g, th),
    }
}

fn sweep_whole_list(g: &mut GlobalState, list: GcList) {
    while let Some(r) = g.heap.first(list) {
        free_object(g, r);
    }
}

/// Finalizes and frees every object of the state. Used when the state is closed.
pub fn free_all_objects(g: &mut GlobalState) {
    separate_tobefnz(g, true);
    debug_assert_eq!(g.heap.list_len(GcList::FinObj), 0);
    call_all_pending_finalizers(g);
    // every object is dead from now on
    g.currentwhite = WHITEBITS;
    g.gckind = GcKind::Normal;
    sweep_whole_list(g, GcList::FinObj);
    sweep_whole_list(g, GcList::AllGc);
    sweep_whole_list(g, GcList::FixedGc);
    debug_assert!(g.heap.is_empty());
    log::debug!(target: "gc", "all objects freed, {} bytes still in use", g.mem.total_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::memory::CountingAllocator;
    use crate::runtime::object::Table;

    #[test]
    fn lists_keep_membership_exclusive() {
        let mut mem = Memory::new(Box::new(CountingAllocator::new()), 0);
        let mut heap = ObjectHeap::new();
        let a = heap
            .alloc(&mut mem, Variant::Table, 1, GcObject::Table(Table::new()))
            .unwrap();
        let b = heap
            .alloc(&mut mem, Variant::Table, 1, GcObject::Table(Table::new()))
            .unwrap();
        assert_eq!(heap.iter_list(GcList::AllGc).collect::<Vec<_>>(), vec![b, a]);

        heap.move_to_end(a, GcList::ToBeFnz);
        assert_eq!(heap.list_len(GcList::AllGc), 1);
        assert_eq!(heap.list_len(GcList::ToBeFnz), 1);
        assert_eq!(heap.header(a).list(), GcList::ToBeFnz);

        let _ = heap.remove(&mut mem, a);
        let _ = heap.remove(&mut mem, b);
        assert!(!heap.contains(a));
        assert!(heap.is_empty());
        assert_eq!(mem.total_bytes(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "points to a freed object")]
    fn storing_a_freed_reference_panics() {
        let mut state = crate::runtime::state::State::new().unwrap();
        let g = &mut *state;
        let t = table::new_table(g).unwrap();
        free_object(g, t);
        let globals = g.globals();
        let _ = table::set_int(g, globals, 1, TValue::Table(t));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "reference tag does not match")]
    fn storing_a_mistagged_reference_panics() {
        let mut state = crate::runtime::state::State::new().unwrap();
        let g = &mut *state;
        let t = table::new_table(g).unwrap();
        let _ = g.push(crate::runtime::value::ThreadId::Main, TValue::LongString(t));
    }

    #[test]
    fn live_references_pass() {
        let mut state = crate::runtime::state::State::new().unwrap();
        let g = &mut *state;
        let t = table::new_table(g).unwrap();
        check_liveness(g, &TValue::Table(t));
        check_liveness(g, &TValue::Int(3));
        let globals = g.globals();
        table::set_int(g, globals, 1, TValue::Table(t)).unwrap();
        assert_eq!(table::get_int(g, globals, 1), TValue::Table(t));
    }

    #[test]
    fn colours() {
        assert!(is_white(1));
        assert!(is_dead(1, 2));
        assert!(!is_dead(1, 1));
        assert!(is_gray(0));
        assert!(to_finalize(1 << FINALIZEDBIT));
    }
}
