//! Core of a Lua 5.3 runtime: tagged values and heap objects, a memory manager with
//! debt accounting, state lifecycle, and the loader/dumper for precompiled chunks.

pub mod gc;
pub mod runtime;
pub mod utils;
pub mod vm;

pub mod prelude {
    pub use crate::gc::{
        memory::{Allocator, CountingAllocator, Memory, SystemAllocator},
        GcRef,
    };
    pub use crate::runtime::{
        error::{LuaError, LuaResult, MalformedReason, Status},
        ltype::{BasicType, LuaType, Variant},
        state::{GlobalState, State},
        value::{TValue, ThreadId},
    };
    pub use crate::vm::options::StateOptions;
}
