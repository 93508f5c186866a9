use std::fmt;

use crate::{
    gc::GcRef,
    runtime::{
        error::LuaResult,
        ltype::{LuaType, Variant},
        state::GlobalState,
    },
};

/// Light native function: a plain function pointer, no captured values.
pub type CFunction = fn(&mut GlobalState, ThreadId) -> LuaResult<i32>;

/// Identifies a thread of a state.
///
/// The main thread is owned by the shared state itself; subordinate threads are heap objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadId {
    Main,
    Sub(GcRef),
}

/// Tagged value.
///
/// The variant is the tag, so payload and tag are always written together. Heap references
/// point into the state's object heap.
#[derive(Clone, Copy, Default)]
pub enum TValue {
    #[default]
    Nil,
    Boolean(bool),
    LightUserData(usize),
    LightCFunction(CFunction),
    Int(i64),
    Float(f64),
    ShortString(GcRef),
    LongString(GcRef),
    Table(GcRef),
    LuaClosure(GcRef),
    CClosure(GcRef),
    UserData(GcRef),
    Thread(ThreadId),
    /// Key of a removed table entry. Only ever found in table nodes.
    DeadKey(GcRef),
}

macro_rules! payload {
    ($($name: ident: $variant: ident -> $ty: ty),*) => {
        paste::paste! {
            impl TValue {
                $(
                    #[inline(always)]
                    pub fn [<is_ $name>](&self) -> bool {
                        matches!(self, TValue::$variant(_))
                    }

                    /// Payload accessor. Calling it on a value of another type is a programming
                    /// error and panics.
                    #[inline]
                    pub fn $name(&self) -> $ty {
                        match self {
                            TValue::$variant(x) => *x,
                            other => wrong_payload(stringify!($variant), other.tag()),
                        }
                    }
                )*
            }
        }
    };
}

payload!(
    boolean: Boolean -> bool,
    light_userdata: LightUserData -> usize,
    light_cfunction: LightCFunction -> CFunction,
    int: Int -> i64,
    float: Float -> f64,
    table: Table -> GcRef,
    lclosure: LuaClosure -> GcRef,
    cclosure: CClosure -> GcRef,
    userdata: UserData -> GcRef,
    thread: Thread -> ThreadId
);

#[cold]
#[inline(never)]
fn wrong_payload(wanted: &str, found: LuaType) -> ! {
    panic!("expected a {} payload, found a value of type {:?}", wanted, found)
}

impl TValue {
    #[inline(always)]
    pub fn tag(&self) -> LuaType {
        match self {
            TValue::Nil => LuaType::new(Variant::Nil),
            TValue::Boolean(_) => LuaType::new(Variant::Boolean),
            TValue::LightUserData(_) => LuaType::new(Variant::LightUserData),
            TValue::LightCFunction(_) => LuaType::new(Variant::LightCFunction),
            TValue::Int(_) => LuaType::new(Variant::Int),
            TValue::Float(_) => LuaType::new(Variant::Float),
            TValue::ShortString(_) => LuaType::heap(Variant::ShortString),
            TValue::LongString(_) => LuaType::heap(Variant::LongString),
            TValue::Table(_) => LuaType::heap(Variant::Table),
            TValue::LuaClosure(_) => LuaType::heap(Variant::LuaClosure),
            TValue::CClosure(_) => LuaType::heap(Variant::CClosure),
            TValue::UserData(_) => LuaType::heap(Variant::UserData),
            TValue::Thread(_) => LuaType::heap(Variant::Thread),
            TValue::DeadKey(_) => LuaType::heap(Variant::DeadKey),
        }
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        matches!(self, TValue::Nil)
    }

    #[inline(always)]
    pub fn is_collectable(&self) -> bool {
        self.tag().is_collectable()
    }

    #[inline(always)]
    pub fn is_string(&self) -> bool {
        matches!(self, TValue::ShortString(_) | TValue::LongString(_))
    }

    #[inline(always)]
    pub fn is_number(&self) -> bool {
        matches!(self, TValue::Int(_) | TValue::Float(_))
    }

    #[inline(always)]
    pub fn is_function(&self) -> bool {
        matches!(
            self,
            TValue::LuaClosure(_) | TValue::CClosure(_) | TValue::LightCFunction(_)
        )
    }

    /// `false` only for nil and `false`.
    #[inline(always)]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, TValue::Nil | TValue::Boolean(false))
    }

    pub fn string(&self) -> GcRef {
        match self {
            TValue::ShortString(r) | TValue::LongString(r) => *r,
            other => wrong_payload("String", other.tag()),
        }
    }

    /// Heap object referenced by this value, if any. The main thread is not a heap object.
    pub fn gc_ref(&self) -> Option<GcRef> {
        match *self {
            TValue::ShortString(r)
            | TValue::LongString(r)
            | TValue::Table(r)
            | TValue::LuaClosure(r)
            | TValue::CClosure(r)
            | TValue::UserData(r)
            | TValue::DeadKey(r)
            | TValue::Thread(ThreadId::Sub(r)) => Some(r),
            _ => None,
        }
    }

    /// Numeric value as a float, converting integers.
    pub fn to_number(&self) -> Option<f64> {
        match *self {
            TValue::Int(i) => Some(i as f64),
            TValue::Float(n) => Some(n),
            _ => None,
        }
    }

    /// Overwrites tag and payload of `self` in one step.
    #[inline(always)]
    pub fn set(&mut self, other: TValue) {
        *self = other;
    }
}

impl PartialEq for TValue {
    /// Identity comparison: same tag and same payload bits. Long strings with equal contents
    /// but different objects are different here; see [`crate::runtime::cmp::raw_equal`].
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TValue::Nil, TValue::Nil) => true,
            (TValue::Boolean(a), TValue::Boolean(b)) => a == b,
            (TValue::LightUserData(a), TValue::LightUserData(b)) => a == b,
            (TValue::LightCFunction(a), TValue::LightCFunction(b)) => *a as usize == *b as usize,
            (TValue::Int(a), TValue::Int(b)) => a == b,
            (TValue::Float(a), TValue::Float(b)) => a.to_bits() == b.to_bits(),
            (TValue::Thread(a), TValue::Thread(b)) => a == b,
            (a, b) => {
                a.tag() == b.tag() && a.gc_ref().is_some() && a.gc_ref() == b.gc_ref()
            }
        }
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TValue::Nil => write!(f, "nil"),
            TValue::Boolean(b) => write!(f, "{}", b),
            TValue::LightUserData(p) => write!(f, "userdata: {:#x}", p),
            TValue::LightCFunction(func) => write!(f, "function: builtin: {:#x}", *func as usize),
            TValue::Int(i) => write!(f, "{}", i),
            TValue::Float(n) => write!(f, "{:?}", n),
            TValue::Thread(ThreadId::Main) => write!(f, "thread: main"),
            other => match other.gc_ref() {
                Some(r) => write!(f, "{}: {:?}", other.tag().name(), r),
                None => write!(f, "{:?}", other.tag()),
            },
        }
    }
}

impl From<bool> for TValue {
    fn from(b: bool) -> Self {
        TValue::Boolean(b)
    }
}

impl From<i64> for TValue {
    fn from(i: i64) -> Self {
        TValue::Int(i)
    }
}

impl From<f64> for TValue {
    fn from(n: f64) -> Self {
        TValue::Float(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_follow_payloads() {
        assert_eq!(TValue::Nil.tag().variant(), Variant::Nil);
        assert_eq!(TValue::Int(3).tag().variant(), Variant::Int);
        assert_eq!(TValue::Float(3.0).tag().variant(), Variant::Float);
        assert!(!TValue::Boolean(true).is_collectable());
        assert!(TValue::Table(GcRef::default()).is_collectable());
        assert!(TValue::Thread(ThreadId::Main).is_collectable());
        assert_eq!(TValue::Thread(ThreadId::Main).gc_ref(), None);
    }

    #[test]
    fn set_replaces_tag_and_payload() {
        let mut v = TValue::Int(1);
        v.set(TValue::Float(2.5));
        assert_eq!(v.float(), 2.5);
        assert!(!v.is_int());
    }

    #[test]
    #[should_panic]
    fn wrong_payload_panics() {
        TValue::Int(1).float();
    }

    #[test]
    fn identity_equality() {
        assert_eq!(TValue::Int(1), TValue::Int(1));
        assert_ne!(TValue::Int(1), TValue::Float(1.0));
        assert!(!TValue::Nil.is_truthy());
        assert!(TValue::Int(0).is_truthy());
    }
}
