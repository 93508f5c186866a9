//! Tables: an array part for the keys `1..=n` plus a hash part of [`Node`]s.
//!
//! Collisions in the hash part are chained through relative offsets stored in the nodes, and
//! a colliding key that is not in its main position is moved away (Brent's variation), so every
//! chain starts at the main position of its keys.
//!
//! Mutating operations take the table out of the heap for their duration, which leaves the
//! heap readable for key hashing and comparison.

use num_traits::Float;
use slotmap::Key;

use crate::{
    gc::{self, memory::Memory, GcRef, ObjectHeap},
    runtime::{
        cmp::{float_to_int, raw_equal},
        error::{LuaError, LuaResult},
        ltype::Variant,
        object::{GcObject, Node, Table},
        state::GlobalState,
        string,
        value::{ThreadId, TValue},
    },
};

/// Largest `n` such that `2^n` array entries are allowed.
pub const MAXABITS: u32 = 31;
pub const MAXASIZE: u64 = 1 << MAXABITS;
/// Largest `n` such that `2^n` hash entries are allowed.
pub const MAXHBITS: u32 = MAXABITS - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Array(usize),
    Node(usize),
}

/// What key hashing needs from the rest of the state.
#[derive(Clone, Copy)]
struct Ctx<'a> {
    heap: &'a ObjectHeap,
    seed: u32,
}

/// `ceil(log2(x))`
#[inline]
fn ceil_log2(x: u64) -> u32 {
    debug_assert!(x > 0);
    64 - (x - 1).leading_zeros()
}

#[inline(always)]
fn hash_pow2(n: u64, size: usize) -> usize {
    (n & (size as u64 - 1)) as usize
}

#[inline(always)]
fn hash_mod(n: u64, size: usize) -> usize {
    (n % ((size as u64 - 1) | 1)) as usize
}

fn hash_float(n: f64) -> u64 {
    if !n.is_finite() {
        return 0;
    }
    let (mantissa, exponent, sign) = n.integer_decode();
    let h = (mantissa as u32 ^ (mantissa >> 32) as u32)
        .wrapping_add(exponent as u32)
        .wrapping_add(sign as u32);
    if h <= i32::MAX as u32 {
        h as u64
    } else {
        !h as u64
    }
}

fn main_position(t: &Table, cx: Ctx, key: &TValue) -> usize {
    let size = t.node.len();
    match *key {
        TValue::Int(i) => hash_pow2(i as u64, size),
        TValue::Float(n) => hash_mod(hash_float(n), size),
        TValue::ShortString(r) => hash_pow2(cx.heap.string(r).hash() as u64, size),
        TValue::LongString(r) => {
            hash_pow2(string::hash_long(cx.heap.string(r), cx.seed) as u64, size)
        }
        TValue::Boolean(b) => hash_pow2(b as u64, size),
        TValue::LightUserData(p) => hash_mod(p as u64, size),
        TValue::LightCFunction(f) => hash_mod(f as usize as u64, size),
        TValue::Thread(ThreadId::Main) => hash_mod(0, size),
        TValue::Nil => unreachable!("nil is never a table key"),
        other => match other.gc_ref() {
            Some(r) => hash_mod(r.data().as_ffi(), size),
            None => unreachable!("unhashable key {:?}", other),
        },
    }
}

fn find_int(t: &Table, key: i64) -> Option<Slot> {
    if (key as u64).wrapping_sub(1) < t.array.len() as u64 {
        return Some(Slot::Array(key as usize - 1));
    }
    if t.node.is_empty() {
        return None;
    }
    let mut n = hash_pow2(key as u64, t.node.len());
    loop {
        let node = &t.node[n];
        if let TValue::Int(k) = node.key {
            if k == key {
                return Some(Slot::Node(n));
            }
        }
        if node.next == 0 {
            return None;
        }
        n = (n as isize + node.next as isize) as usize;
    }
}

fn find_generic(t: &Table, cx: Ctx, key: &TValue) -> Option<Slot> {
    if t.node.is_empty() {
        return None;
    }
    let mut n = main_position(t, cx, key);
    loop {
        let node = &t.node[n];
        if raw_equal(cx.heap, &node.key, key) {
            return Some(Slot::Node(n));
        }
        if node.next == 0 {
            return None;
        }
        n = (n as isize + node.next as isize) as usize;
    }
}

fn find(t: &Table, cx: Ctx, key: &TValue) -> Option<Slot> {
    match *key {
        TValue::Nil => None,
        TValue::Int(i) => find_int(t, i),
        TValue::Float(n) => match float_to_int(n) {
            Some(i) => find_int(t, i),
            None => find_generic(t, cx, key),
        },
        TValue::ShortString(r) => {
            if t.node.is_empty() {
                return None;
            }
            let mut n = main_position(t, cx, key);
            loop {
                let node = &t.node[n];
                if let TValue::ShortString(k) = node.key {
                    if k == r {
                        return Some(Slot::Node(n));
                    }
                }
                if node.next == 0 {
                    return None;
                }
                n = (n as isize + node.next as isize) as usize;
            }
        }
        _ => find_generic(t, cx, key),
    }
}

fn read(t: &Table, slot: Option<Slot>) -> TValue {
    match slot {
        Some(Slot::Array(i)) => t.array[i],
        Some(Slot::Node(n)) => t.node[n].val,
        None => TValue::Nil,
    }
}

fn slot_mut(t: &mut Table, slot: Slot) -> &mut TValue {
    match slot {
        Slot::Array(i) => &mut t.array[i],
        Slot::Node(n) => &mut t.node[n].val,
    }
}

fn get_free_pos(t: &mut Table) -> Option<usize> {
    while t.lastfree > 0 {
        t.lastfree -= 1;
        if t.node[t.lastfree].key.is_nil() {
            return Some(t.lastfree);
        }
    }
    None
}

/// Array index of a key, 0 if it cannot live in the array part.
fn array_index(key: &TValue) -> u64 {
    match *key {
        TValue::Int(k) if k > 0 && (k as u64) <= MAXASIZE => k as u64,
        _ => 0,
    }
}

fn count_int(key: &TValue, nums: &mut [u64]) -> u64 {
    let k = array_index(key);
    if k != 0 {
        nums[ceil_log2(k) as usize] += 1;
        1
    } else {
        0
    }
}

/// Counts the non-nil entries of the array part, per power-of-two slice.
fn num_use_array(t: &Table, nums: &mut [u64]) -> u64 {
    let size = t.array.len() as u64;
    let mut ause = 0;
    let mut i = 1u64;
    let mut ttlg = 1u64;
    for lg in 0..=MAXABITS as usize {
        let mut lc = 0;
        let mut lim = ttlg;
        if lim > size {
            lim = size;
            if i > lim {
                break;
            }
        }
        while i <= lim {
            if !t.array[i as usize - 1].is_nil() {
                lc += 1;
            }
            i += 1;
        }
        nums[lg] += lc;
        ause += lc;
        ttlg *= 2;
    }
    ause
}

fn num_use_hash(t: &Table, nums: &mut [u64], na: &mut u64) -> u64 {
    let mut totaluse = 0;
    let mut ause = 0;
    for node in t.node.iter().rev() {
        if !node.val.is_nil() {
            ause += count_int(&node.key, nums);
            totaluse += 1;
        }
    }
    *na += ause;
    totaluse
}

/// Optimal array size: the largest `n` such that more than half of `1..=n` is in use.
/// Updates `na` to the number of keys that go to the array part.
fn compute_sizes(nums: &[u64], na: &mut u64) -> u64 {
    let mut a = 0;
    let mut nna = 0;
    let mut optimal = 0;
    let mut twotoi = 1u64;
    let mut i = 0;
    while i <= MAXABITS as usize && *na > twotoi / 2 {
        if nums[i] > 0 {
            a += nums[i];
            if a > twotoi / 2 {
                optimal = twotoi;
                nna = a;
            }
        }
        i += 1;
        twotoi *= 2;
    }
    *na = nna;
    optimal
}

fn set_node_vector(mem: &mut Memory, t: &mut Table, size: usize) -> LuaResult<()> {
    if size == 0 {
        t.node = Default::default();
        t.lastfree = 0;
        return Ok(());
    }
    let lsize = ceil_log2(size as u64);
    if lsize > MAXHBITS {
        return Err(LuaError::runtime("table overflow"));
    }
    t.node = mem.new_vector(1 << lsize, Node::default())?;
    t.lastfree = t.node.len();
    Ok(())
}

fn resize_parts(
    t: &mut Table,
    cx: Ctx,
    mem: &mut Memory,
    nasize: usize,
    nhsize: usize,
) -> LuaResult<()> {
    let oldasize = t.array.len();
    if nasize > oldasize {
        mem.resize_vector(&mut t.array, nasize, TValue::Nil)?;
    }
    let mut nold = std::mem::take(&mut t.node);
    if let Err(err) = set_node_vector(mem, t, nhsize) {
        t.node = nold;
        return Err(err);
    }

    if nasize < oldasize {
        let vanishing: Vec<(usize, TValue)> = (nasize..oldasize)
            .filter(|i| !t.array[*i].is_nil())
            .map(|i| (i, t.array[i]))
            .collect();
        mem.resize_vector(&mut t.array, nasize, TValue::Nil)?;
        for (i, v) in vanishing {
            let slot = insert(t, cx, mem, TValue::Int(i as i64 + 1))?;
            *slot_mut(t, slot) = v;
        }
    }

    for j in (0..nold.len()).rev() {
        let old = nold[j];
        if !old.val.is_nil() {
            let slot = insert(t, cx, mem, old.key)?;
            *slot_mut(t, slot) = old.val;
        }
    }
    mem.free_vector(&mut nold);
    Ok(())
}

/// Grows the table to fit `extra_key` and everything it holds.
fn rehash(t: &mut Table, cx: Ctx, mem: &mut Memory, extra_key: &TValue) -> LuaResult<()> {
    let mut nums = [0u64; MAXABITS as usize + 1];
    let mut na = num_use_array(t, &mut nums);
    let mut totaluse = na;
    totaluse += num_use_hash(t, &mut nums, &mut na);
    na += count_int(extra_key, &mut nums);
    totaluse += 1;
    let asize = compute_sizes(&nums, &mut na);
    log::trace!(target: "table", "rehash: array {} -> {}, hash {}", t.array.len(), asize, totaluse - na);
    resize_parts(t, cx, mem, asize as usize, (totaluse - na) as usize)
}

/// Slot for `key`, creating it (with a nil value) if absent.
fn insert(t: &mut Table, cx: Ctx, mem: &mut Memory, key: TValue) -> LuaResult<Slot> {
    match find(t, cx, &key) {
        Some(slot) => Ok(slot),
        None => new_key(t, cx, mem, key),
    }
}

fn new_key(t: &mut Table, cx: Ctx, mem: &mut Memory, key: TValue) -> LuaResult<Slot> {
    let key = match key {
        TValue::Nil => return Err(LuaError::runtime("index is nil")),
        TValue::Float(n) => match float_to_int(n) {
            Some(i) => TValue::Int(i),
            None if n.is_nan() => return Err(LuaError::runtime("index is NaN")),
            None => key,
        },
        _ => key,
    };

    if t.node.is_empty() {
        rehash(t, cx, mem, &key)?;
        return insert(t, cx, mem, key);
    }

    let mut mp = main_position(t, cx, &key);
    if !t.node[mp].val.is_nil() {
        // main position is taken
        let Some(f) = get_free_pos(t) else {
            rehash(t, cx, mem, &key)?;
            return insert(t, cx, mem, key);
        };
        let mut othern = main_position(t, cx, &t.node[mp].key);
        if othern != mp {
            // colliding node is out of its main position: move it to the free slot
            while (othern as isize + t.node[othern].next as isize) as usize != mp {
                othern = (othern as isize + t.node[othern].next as isize) as usize;
            }
            t.node[othern].next = (f as isize - othern as isize) as i32;
            t.node[f] = t.node[mp];
            if t.node[mp].next != 0 {
                t.node[f].next += (mp as isize - f as isize) as i32;
                t.node[mp].next = 0;
            }
            t.node[mp].val = TValue::Nil;
        } else {
            // new key goes to the free position
            if t.node[mp].next != 0 {
                t.node[f].next = (mp as isize + t.node[mp].next as isize - f as isize) as i32;
            } else {
                debug_assert_eq!(t.node[f].next, 0);
            }
            t.node[mp].next = (f as isize - mp as isize) as i32;
            mp = f;
        }
    }
    t.node[mp].key = key;
    debug_assert!(t.node[mp].val.is_nil());
    Ok(Slot::Node(mp))
}

/// Runs `f` with the table moved out of the heap.
fn with_table<R>(
    g: &mut GlobalState,
    t: GcRef,
    f: impl FnOnce(&mut Table, Ctx, &mut Memory) -> LuaResult<R>,
) -> LuaResult<R> {
    let mut table = std::mem::take(g.heap.table_mut(t));
    let cx = Ctx {
        heap: &g.heap,
        seed: g.seed,
    };
    let result = f(&mut table, cx, &mut g.mem);
    *g.heap.table_mut(t) = table;
    result
}

pub fn new_table(g: &mut GlobalState) -> LuaResult<GcRef> {
    let white = g.currentwhite;
    g.heap
        .alloc(&mut g.mem, Variant::Table, white, GcObject::Table(Table::new()))
}

pub fn resize(g: &mut GlobalState, t: GcRef, nasize: usize, nhsize: usize) -> LuaResult<()> {
    with_table(g, t, |table, cx, mem| {
        resize_parts(table, cx, mem, nasize, nhsize)
    })
}

pub fn resize_array(g: &mut GlobalState, t: GcRef, nasize: usize) -> LuaResult<()> {
    let nhsize = g.heap.table(t).node.len();
    resize(g, t, nasize, nhsize)
}

pub fn get(g: &GlobalState, t: GcRef, key: &TValue) -> TValue {
    let table = g.heap.table(t);
    let cx = Ctx {
        heap: &g.heap,
        seed: g.seed,
    };
    read(table, find(table, cx, key))
}

pub fn get_int(g: &GlobalState, t: GcRef, key: i64) -> TValue {
    let table = g.heap.table(t);
    read(table, find_int(table, key))
}

pub fn get_short_str(g: &GlobalState, t: GcRef, key: GcRef) -> TValue {
    get(g, t, &TValue::ShortString(key))
}

pub fn get_str(g: &GlobalState, t: GcRef, key: GcRef) -> TValue {
    get(g, t, &string::value(g, key))
}

/// `t[key] = val` without metamethods.
pub fn set(g: &mut GlobalState, t: GcRef, key: TValue, val: TValue) -> LuaResult<()> {
    gc::check_liveness(g, &key);
    gc::check_liveness(g, &val);
    // the flags cache absent metamethods, which a new key may invalidate
    g.heap.table_mut(t).flags = 0;
    with_table(g, t, |table, cx, mem| {
        let slot = insert(table, cx, mem, key)?;
        *slot_mut(table, slot) = val;
        Ok(())
    })
}

pub fn set_int(g: &mut GlobalState, t: GcRef, key: i64, val: TValue) -> LuaResult<()> {
    if let Some(slot) = find_int(g.heap.table(t), key) {
        gc::check_liveness(g, &val);
        *slot_mut(g.heap.table_mut(t), slot) = val;
        return Ok(());
    }
    set(g, t, TValue::Int(key), val)
}

fn unbound_search(t: &Table, j: u64) -> u64 {
    let mut i = j;
    let mut j = j + 1;
    let absent = |k: u64| read(t, find_int(t, k as i64)).is_nil();
    while !absent(j) {
        i = j;
        if j > i64::MAX as u64 / 2 {
            // pathological table: linear search
            let mut i = 1;
            while !absent(i) {
                i += 1;
            }
            return i - 1;
        }
        j *= 2;
    }
    while j - i > 1 {
        let m = (i + j) / 2;
        if absent(m) {
            j = m;
        } else {
            i = m;
        }
    }
    i
}

/// A border of the table: an index `n` such that `t[n]` is not nil and `t[n + 1]` is nil
/// (0 if `t[1]` is nil).
pub fn length(g: &GlobalState, t: GcRef) -> u64 {
    let table = g.heap.table(t);
    let mut j = table.array.len() as u64;
    if j > 0 && table.array[j as usize - 1].is_nil() {
        let mut i = 0;
        while j - i > 1 {
            let m = (i + j) / 2;
            if table.array[m as usize - 1].is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    } else if table.node.is_empty() {
        j
    } else {
        unbound_search(table, j)
    }
}

pub fn set_metatable(g: &mut GlobalState, t: GcRef, mt: Option<GcRef>) {
    g.heap.table_mut(t).metatable = mt;
    gc::check_finalizer(g, t, mt);
}

pub fn free(mem: &mut Memory, t: &mut Table) {
    mem.free_vector(&mut t.array);
    mem.free_vector(&mut t.node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::State;

    #[test]
    fn sizes() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(1024), 10);
        let mut nums = [0u64; MAXABITS as usize + 1];
        // keys 1, 2, 3
        nums[0] = 1;
        nums[1] = 1;
        nums[2] = 1;
        let mut na = 3;
        assert_eq!(compute_sizes(&nums, &mut na), 4);
        assert_eq!(na, 3);
    }

    #[test]
    fn integer_keys_go_to_the_array() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let t = new_table(g).unwrap();
        for i in 1..=10 {
            set_int(g, t, i, TValue::Int(i * 10)).unwrap();
        }
        for i in 1..=10 {
            assert_eq!(get_int(g, t, i), TValue::Int(i * 10));
        }
        assert_eq!(get_int(g, t, 11), TValue::Nil);
        assert!(g.heap.table(t).array_size() >= 8);
        assert_eq!(length(g, t), 10);
    }

    #[test]
    fn mixed_keys() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let t = new_table(g).unwrap();
        let name = string::new_str(g, "name").unwrap();
        let long = string::new_str(g, &"k".repeat(60)).unwrap();
        let long_again = string::new_str(g, &"k".repeat(60)).unwrap();
        set(g, t, TValue::ShortString(name), TValue::Boolean(true)).unwrap();
        set(g, t, TValue::LongString(long), TValue::Int(7)).unwrap();
        set(g, t, TValue::Float(2.5), TValue::Int(8)).unwrap();
        set(g, t, TValue::Float(3.0), TValue::Int(9)).unwrap();
        set(g, t, TValue::Boolean(false), TValue::Int(10)).unwrap();

        assert_eq!(get_short_str(g, t, name), TValue::Boolean(true));
        // long string keys compare by contents
        assert_eq!(get(g, t, &TValue::LongString(long_again)), TValue::Int(7));
        assert_eq!(get(g, t, &TValue::Float(2.5)), TValue::Int(8));
        // 3.0 was normalised to an integer key
        assert_eq!(get_int(g, t, 3), TValue::Int(9));
        assert_eq!(get(g, t, &TValue::Boolean(false)), TValue::Int(10));
        assert_eq!(get(g, t, &TValue::Boolean(true)), TValue::Nil);
    }

    #[test]
    fn many_collisions_keep_every_key() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let t = new_table(g).unwrap();
        for i in 0..200 {
            let key = TValue::Float(i as f64 + 0.5);
            set(g, t, key, TValue::Int(i)).unwrap();
        }
        for i in 0..200 {
            assert_eq!(get(g, t, &TValue::Float(i as f64 + 0.5)), TValue::Int(i));
        }
        assert!(g.heap.table(t).node_size() >= 200);
    }

    #[test]
    fn invalid_keys() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let t = new_table(g).unwrap();
        let err = set(g, t, TValue::Nil, TValue::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "index is nil");
        let err = set(g, t, TValue::Float(f64::NAN), TValue::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "index is NaN");
        assert_eq!(get(g, t, &TValue::Nil), TValue::Nil);
    }

    #[test]
    fn shrinking_moves_entries_to_the_hash_part() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let t = new_table(g).unwrap();
        resize(g, t, 8, 0).unwrap();
        for i in 1..=8 {
            set_int(g, t, i, TValue::Int(-i)).unwrap();
        }
        resize(g, t, 2, 8).unwrap();
        assert_eq!(g.heap.table(t).array_size(), 2);
        for i in 1..=8 {
            assert_eq!(get_int(g, t, i), TValue::Int(-i));
        }
    }
}
