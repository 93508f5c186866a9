//! Heap object bodies.
//!
//! Every collected object is a [`GcObject`] stored behind a [`crate::gc::GcHeader`] in the
//! state's [`crate::gc::ObjectHeap`]. Objects own their vectors; those are released through
//! the memory manager when the object is freed.

use slotmap::new_key_type;

use crate::{
    gc::{memory::LVec, GcRef},
    runtime::{
        state::ThreadState,
        value::{CFunction, TValue, ThreadId},
    },
};

new_key_type! {
    /// Handle to a reference counted upvalue cell.
    pub struct UpvalId;
}

/// Maximum length of an interned string.
pub const MAX_SHORT_LEN: usize = 40;

pub struct LString {
    /// Reserved-word index (1-based) for short strings; "hash computed" flag for long ones.
    pub(crate) extra: u8,
    pub(crate) hash: u32,
    /// Next string in the same string-table bucket.
    pub(crate) hnext: Option<GcRef>,
    pub(crate) contents: LVec<u8>,
}

impl LString {
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.contents.as_slice()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Reserved-word index of an interned string, 0 when it is not a reserved word.
    pub fn reserved(&self) -> u8 {
        self.extra
    }

    pub fn to_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

pub struct Udata {
    pub(crate) metatable: Option<GcRef>,
    pub(crate) user_value: TValue,
    pub(crate) data: LVec<u8>,
}

impl Udata {
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    pub fn user_value(&self) -> TValue {
        self.user_value
    }

    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Node {
    pub(crate) val: TValue,
    pub(crate) key: TValue,
    /// Offset to the next node of the collision chain, 0 at the end of the chain.
    pub(crate) next: i32,
}

pub struct Table {
    /// Cache of absent metamethods, one bit per event.
    pub(crate) flags: u8,
    pub(crate) array: LVec<TValue>,
    pub(crate) node: LVec<Node>,
    /// Free positions are searched below this index.
    pub(crate) lastfree: usize,
    pub(crate) metatable: Option<GcRef>,
}

impl Table {
    pub const fn new() -> Self {
        Self {
            flags: !0,
            array: LVec::empty(),
            node: LVec::empty(),
            lastfree: 0,
            metatable: None,
        }
    }

    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    pub fn node_size(&self) -> usize {
        self.node.len()
    }

    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct LocVar {
    pub varname: Option<GcRef>,
    /// First point where the variable is active.
    pub startpc: i32,
    /// First point where the variable is dead.
    pub endpc: i32,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Upvaldesc {
    pub name: Option<GcRef>,
    /// Whether the upvalue is a register of the enclosing function.
    pub instack: bool,
    /// Index in the stack or in the outer function's upvalue list.
    pub idx: u8,
}

#[derive(Default)]
pub struct Proto {
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    pub linedefined: i32,
    pub lastlinedefined: i32,
    pub code: LVec<u32>,
    pub k: LVec<TValue>,
    pub p: LVec<GcRef>,
    pub upvalues: LVec<Upvaldesc>,
    pub lineinfo: LVec<i32>,
    pub locvars: LVec<LocVar>,
    pub source: Option<GcRef>,
}

pub struct LClosure {
    pub(crate) proto: Option<GcRef>,
    pub(crate) upvals: LVec<Option<UpvalId>>,
}

impl LClosure {
    pub fn proto(&self) -> Option<GcRef> {
        self.proto
    }

    pub fn nupvalues(&self) -> usize {
        self.upvals.len()
    }

    pub fn upvalue(&self, i: usize) -> Option<UpvalId> {
        self.upvals[i]
    }
}

pub struct CClosure {
    pub(crate) f: CFunction,
    pub(crate) upvalue: LVec<TValue>,
}

impl CClosure {
    pub fn function(&self) -> CFunction {
        self.f
    }

    pub fn upvalues(&self) -> &[TValue] {
        self.upvalue.as_slice()
    }
}

/// Where an upvalue's value currently lives.
#[derive(Clone, Copy, Debug)]
pub enum UpvalSlot {
    /// Still a register of `thread`, at stack index `level`.
    Open { thread: ThreadId, level: usize },
    Closed(TValue),
}

/// Captured variable cell shared by closures. Not a collected object: it lives as long as a
/// closure references it or it is open.
#[derive(Clone, Copy, Debug)]
pub struct UpVal {
    pub(crate) slot: UpvalSlot,
    pub(crate) refcount: usize,
    /// Next open upvalue of the same thread, at a lower stack level.
    pub(crate) open_next: Option<UpvalId>,
    /// Marked while the collector is traversing the open list.
    pub(crate) touched: bool,
}

impl UpVal {
    pub fn is_open(&self) -> bool {
        matches!(self.slot, UpvalSlot::Open { .. })
    }

    pub fn level(&self) -> Option<usize> {
        match self.slot {
            UpvalSlot::Open { level, .. } => Some(level),
            UpvalSlot::Closed(_) => None,
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }
}

pub enum GcObject {
    String(LString),
    UserData(Udata),
    Table(Table),
    Proto(Proto),
    LuaClosure(LClosure),
    CClosure(CClosure),
    Thread(crate::gc::memory::LBox<ThreadState>),
}

macro_rules! projections {
    ($($variant: ident => $name: ident: $ty: ty),*) => {
        paste::paste! {
            impl GcObject {
                $(
                    #[inline(always)]
                    pub fn [<is_ $name>](&self) -> bool {
                        matches!(self, GcObject::$variant(_))
                    }

                    #[inline(always)]
                    pub fn [<as_ $name>](&self) -> Option<&$ty> {
                        match self {
                            GcObject::$variant(x) => Some(x),
                            _ => None,
                        }
                    }

                    #[inline(always)]
                    pub fn [<as_ $name _mut>](&mut self) -> Option<&mut $ty> {
                        match self {
                            GcObject::$variant(x) => Some(x),
                            _ => None,
                        }
                    }
                )*
            }
        }
    };
}

projections!(
    String => string: LString,
    UserData => udata: Udata,
    Table => table: Table,
    Proto => proto: Proto,
    LuaClosure => lclosure: LClosure,
    CClosure => cclosure: CClosure,
    Thread => thread: ThreadState
);
