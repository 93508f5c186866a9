//! Strings and the string table.
//!
//! Short strings (up to [`MAX_SHORT_LEN`] bytes) are interned: the table holds exactly one
//! object per content, so they compare by identity. Long strings are created fresh every time.

use std::io::Cursor;

use crate::{
    gc::{self, memory::LVec, GcRef},
    runtime::{
        error::LuaResult,
        ltype::Variant,
        object::{GcObject, LString, Udata, MAX_SHORT_LEN},
        state::GlobalState,
        value::TValue,
    },
};

/// Initial size of the string table.
pub const MINSTRTABSIZE: usize = 128;
pub const MEMERRMSG: &str = "not enough memory";

pub struct StringTable {
    pub(crate) hash: LVec<Option<GcRef>>,
    pub(crate) nuse: usize,
}

impl StringTable {
    pub const fn new() -> Self {
        Self {
            hash: LVec::empty(),
            nuse: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.hash.len()
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.nuse
    }

    pub fn is_empty(&self) -> bool {
        self.nuse == 0
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[inline(always)]
fn lmod(h: u32, size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    h as usize & (size - 1)
}

pub fn hash(bytes: &[u8], seed: u32) -> u32 {
    // reading from memory cannot fail
    murmur3::murmur3_32(&mut Cursor::new(bytes), seed).unwrap_or(seed)
}

/// Hash of a long string, computed on demand.
pub fn hash_long(s: &LString, seed: u32) -> u32 {
    if s.extra != 0 {
        s.hash
    } else {
        hash(s.as_bytes(), seed)
    }
}

pub fn eq_long(a: &LString, b: &LString) -> bool {
    a.len() == b.len() && a.as_bytes() == b.as_bytes()
}

/// Equality of two string objects.
pub fn eq_str(g: &GlobalState, a: GcRef, b: GcRef) -> bool {
    if a == b {
        return true;
    }
    let short = |r| g.heap.header(r).tag().variant() == Variant::ShortString;
    !short(a) && !short(b) && eq_long(g.heap.string(a), g.heap.string(b))
}

/// Rehashes the string table to `newsize` buckets.
pub fn resize(g: &mut GlobalState, newsize: usize) -> LuaResult<()> {
    let GlobalState {
        strt, heap, mem, ..
    } = g;
    let oldsize = strt.size();
    if newsize > oldsize {
        mem.resize_vector(&mut strt.hash, newsize, None)?;
    }
    for i in 0..oldsize {
        let mut p = strt.hash[i].take();
        while let Some(r) = p {
            let s = heap.string_mut(r);
            p = s.hnext;
            let h = lmod(s.hash, newsize);
            s.hnext = strt.hash[h];
            strt.hash[h] = Some(r);
        }
    }
    if newsize < oldsize {
        debug_assert!(strt.hash.iter().skip(newsize).all(Option::is_none));
        mem.resize_vector(&mut strt.hash, newsize, None)?;
    }
    log::trace!(target: "string", "string table resized {} -> {}", oldsize, newsize);
    Ok(())
}

/// Creates the string table and the preallocated memory error message.
pub fn init(g: &mut GlobalState) -> LuaResult<()> {
    resize(g, MINSTRTABSIZE)?;
    let msg = new_str(g, MEMERRMSG)?;
    gc::fix(g, msg);
    g.memerrmsg = Some(msg);
    Ok(())
}

fn create_str_obj(
    g: &mut GlobalState,
    len: usize,
    variant: Variant,
    h: u32,
) -> LuaResult<GcRef> {
    let white = g.currentwhite;
    g.heap.alloc_with(&mut g.mem, variant, white, |mem| {
        Ok(GcObject::String(LString {
            extra: 0,
            hash: h,
            hnext: None,
            contents: mem.new_vector(len, 0)?,
        }))
    })
}

/// New long string of `len` zero bytes, to be filled in place.
pub fn create_long(g: &mut GlobalState, len: usize) -> LuaResult<GcRef> {
    let seed = g.seed;
    create_str_obj(g, len, Variant::LongString, seed)
}

fn intern_short(g: &mut GlobalState, bytes: &[u8]) -> LuaResult<GcRef> {
    let h = hash(bytes, g.seed);
    let mut p = g.strt.hash[lmod(h, g.strt.size())];
    while let Some(r) = p {
        let s = g.heap.string(r);
        let (found, next) = (s.as_bytes() == bytes, s.hnext);
        if found {
            let header = g.heap.header_mut(r);
            if gc::is_dead(g.currentwhite, header.marked) {
                // resurrect it
                header.marked ^= gc::WHITEBITS;
            }
            return Ok(r);
        }
        p = next;
    }

    if g.strt.nuse >= g.strt.size() && g.strt.size() <= i32::MAX as usize / 2 {
        resize(g, g.strt.size() * 2)?;
    }
    let r = create_str_obj(g, bytes.len(), Variant::ShortString, h)?;
    let bucket = lmod(h, g.strt.size());
    let s = g.heap.string_mut(r);
    s.contents.as_mut_slice().copy_from_slice(bytes);
    s.hnext = g.strt.hash[bucket];
    g.strt.hash[bucket] = Some(r);
    g.strt.nuse += 1;
    Ok(r)
}

/// New string with explicit contents. Short strings are interned.
pub fn new_lstr(g: &mut GlobalState, bytes: &[u8]) -> LuaResult<GcRef> {
    if bytes.len() <= MAX_SHORT_LEN {
        intern_short(g, bytes)
    } else {
        let r = create_long(g, bytes.len())?;
        g.heap
            .string_mut(r)
            .contents
            .as_mut_slice()
            .copy_from_slice(bytes);
        Ok(r)
    }
}

pub fn new_str(g: &mut GlobalState, s: &str) -> LuaResult<GcRef> {
    new_lstr(g, s.as_bytes())
}

/// String value for a string object, choosing the variant from the object.
pub fn value(g: &GlobalState, r: GcRef) -> TValue {
    match g.heap.header(r).tag().variant() {
        Variant::ShortString => TValue::ShortString(r),
        _ => TValue::LongString(r),
    }
}

/// Unlinks an interned string from the table. Called when the string is freed.
pub fn remove(g: &mut GlobalState, r: GcRef) {
    let h = g.heap.string(r).hash;
    let bucket = lmod(h, g.strt.size());
    let mut prev: Option<GcRef> = None;
    let mut p = g.strt.hash[bucket];
    while let Some(cur) = p {
        let next = g.heap.string(cur).hnext;
        if cur == r {
            match prev {
                Some(prev) => g.heap.string_mut(prev).hnext = next,
                None => g.strt.hash[bucket] = next,
            }
            g.strt.nuse -= 1;
            return;
        }
        prev = Some(cur);
        p = next;
    }
    // a string whose creation failed half way never made it into the table
    log::trace!(target: "string", "{:?} was not interned", r);
}

pub fn free_table(g: &mut GlobalState) {
    debug_assert_eq!(g.strt.nuse, 0, "strings left in the string table");
    g.mem.free_vector(&mut g.strt.hash);
}

pub fn new_udata(g: &mut GlobalState, size: usize) -> LuaResult<GcRef> {
    let white = g.currentwhite;
    g.heap.alloc_with(&mut g.mem, Variant::UserData, white, |mem| {
        Ok(GcObject::UserData(Udata {
            metatable: None,
            user_value: TValue::Nil,
            data: mem.new_vector(size, 0)?,
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::State;

    #[test]
    fn short_strings_are_interned() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let a = new_str(g, "hello").unwrap();
        let b = new_lstr(g, b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(g.heap.string(a).as_bytes(), b"hello");
        assert!(matches!(value(g, a), TValue::ShortString(_)));
    }

    #[test]
    fn long_strings_are_not() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let text = "x".repeat(MAX_SHORT_LEN + 1);
        let a = new_str(g, &text).unwrap();
        let b = new_str(g, &text).unwrap();
        assert_ne!(a, b);
        assert!(eq_str(g, a, b));
        assert!(matches!(value(g, a), TValue::LongString(_)));
        let short = new_str(g, "x").unwrap();
        assert!(!eq_str(g, a, short));
    }

    #[test]
    fn table_grows_past_initial_size() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let before = g.strt.len();
        for i in 0..(2 * MINSTRTABSIZE) {
            new_str(g, &format!("s{}", i)).unwrap();
        }
        assert_eq!(g.strt.len(), before + 2 * MINSTRTABSIZE);
        assert!(g.strt.size() >= 2 * MINSTRTABSIZE);
        for i in 0..(2 * MINSTRTABSIZE) {
            let name = format!("s{}", i);
            let r = new_str(g, &name).unwrap();
            assert_eq!(g.heap.string(r).as_bytes(), name.as_bytes());
        }
        assert_eq!(g.strt.len(), before + 2 * MINSTRTABSIZE);
    }

    #[test]
    fn hash_depends_on_seed() {
        assert_eq!(hash(b"abc", 1), hash(b"abc", 1));
        assert_ne!(hash(b"abc", 1), hash(b"abc", 2));
    }
}
