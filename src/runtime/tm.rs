//! Metamethod events and their lookup.

use crate::{
    gc::{self, GcRef},
    runtime::{
        error::LuaResult,
        ltype::NUM_TAGS,
        state::GlobalState,
        string, table,
        value::TValue,
    },
};

/// Metamethod events. The order matters: events up to [`TMS::Eq`] are cached in the
/// table's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TMS {
    Index,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
}

pub const TM_N: usize = TMS::Call as usize + 1;

impl TMS {
    pub const ALL: [TMS; TM_N] = [
        TMS::Index,
        TMS::NewIndex,
        TMS::Gc,
        TMS::Mode,
        TMS::Len,
        TMS::Eq,
        TMS::Add,
        TMS::Sub,
        TMS::Mul,
        TMS::Mod,
        TMS::Pow,
        TMS::Div,
        TMS::IDiv,
        TMS::BAnd,
        TMS::BOr,
        TMS::BXor,
        TMS::Shl,
        TMS::Shr,
        TMS::Unm,
        TMS::BNot,
        TMS::Lt,
        TMS::Le,
        TMS::Concat,
        TMS::Call,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TMS::Index => "__index",
            TMS::NewIndex => "__newindex",
            TMS::Gc => "__gc",
            TMS::Mode => "__mode",
            TMS::Len => "__len",
            TMS::Eq => "__eq",
            TMS::Add => "__add",
            TMS::Sub => "__sub",
            TMS::Mul => "__mul",
            TMS::Mod => "__mod",
            TMS::Pow => "__pow",
            TMS::Div => "__div",
            TMS::IDiv => "__idiv",
            TMS::BAnd => "__band",
            TMS::BOr => "__bor",
            TMS::BXor => "__bxor",
            TMS::Shl => "__shl",
            TMS::Shr => "__shr",
            TMS::Unm => "__unm",
            TMS::BNot => "__bnot",
            TMS::Lt => "__lt",
            TMS::Le => "__le",
            TMS::Concat => "__concat",
            TMS::Call => "__call",
        }
    }

    /// Whether absence of this event is cached in table flags.
    #[inline(always)]
    pub fn is_cached(self) -> bool {
        self as u8 <= TMS::Eq as u8
    }
}

/// Interns the event names. They are never collected.
pub fn init(g: &mut GlobalState) -> LuaResult<()> {
    for event in TMS::ALL {
        let name = string::new_str(g, event.name())?;
        gc::fix(g, name);
        g.tmname[event as usize] = Some(name);
    }
    Ok(())
}

fn event_name(g: &GlobalState, event: TMS) -> GcRef {
    match g.tmname[event as usize] {
        Some(name) => name,
        None => panic!("metamethod names are not initialized"),
    }
}

/// Raw lookup of `event` in the metatable `events`, recording a miss in its flags.
pub fn get_tm(g: &mut GlobalState, events: GcRef, event: TMS) -> Option<TValue> {
    debug_assert!(event.is_cached());
    let tm = table::get_short_str(g, events, event_name(g, event));
    if tm.is_nil() {
        g.heap.table_mut(events).flags |= 1 << event as u8;
        None
    } else {
        Some(tm)
    }
}

/// Lookup for the cached events: a set flag means the metatable has no such field.
pub fn fast_tm(g: &mut GlobalState, mt: GcRef, event: TMS) -> Option<TValue> {
    if g.heap.table(mt).flags & (1 << event as u8) != 0 {
        None
    } else {
        get_tm(g, mt, event)
    }
}

/// Metatable of any value: tables and full userdata have their own, other types share one
/// per basic type.
pub fn metatable_of(g: &GlobalState, o: &TValue) -> Option<GcRef> {
    match *o {
        TValue::Table(t) => g.heap.table(t).metatable(),
        TValue::UserData(u) => g.heap.udata(u).metatable(),
        _ => {
            let basic = o.tag().basic() as usize;
            debug_assert!(basic < NUM_TAGS);
            g.mt[basic]
        }
    }
}

pub fn get_tm_by_obj(g: &GlobalState, o: &TValue, event: TMS) -> TValue {
    match metatable_of(g, o) {
        Some(mt) => table::get_short_str(g, mt, event_name(g, event)),
        None => TValue::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::State;

    #[test]
    fn names() {
        assert_eq!(TM_N, 24);
        assert_eq!(TMS::ALL[TMS::Concat as usize], TMS::Concat);
        assert_eq!(TMS::IDiv.name(), "__idiv");
        assert!(TMS::Eq.is_cached());
        assert!(!TMS::Add.is_cached());
    }

    #[test]
    fn misses_are_cached() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let mt = table::new_table(g).unwrap();
        g.heap.table_mut(mt).flags = 0;
        assert!(fast_tm(g, mt, TMS::Gc).is_none());
        assert_ne!(g.heap.table(mt).flags & (1 << TMS::Gc as u8), 0);

        let gc = g.tmname[TMS::Gc as usize].unwrap();
        table::set(g, mt, TValue::ShortString(gc), TValue::Boolean(true)).unwrap();
        // setting a field clears the cache
        assert_eq!(fast_tm(g, mt, TMS::Gc), Some(TValue::Boolean(true)));

        let t = table::new_table(g).unwrap();
        table::set_metatable(g, t, Some(mt));
        assert_eq!(
            get_tm_by_obj(g, &TValue::Table(t), TMS::Gc),
            TValue::Boolean(true)
        );
        assert_eq!(get_tm_by_obj(g, &TValue::Int(1), TMS::Gc), TValue::Nil);
    }
}
