//! Type tags.
//!
//! In memory a tag is the pair ([`Variant`], heap-owned flag). The packed one-byte form only
//! exists at the chunk boundary: bits 0-3 hold the basic kind, bits 4-5 the variant and bit 6
//! the heap-owned flag. Bit 7 is only used by [`Variant::None`].

use std::fmt;

use crate::runtime::error::{LuaError, LuaResult};

pub const BASIC_BITS: u8 = 0x0F;
pub const VARIANT_SHIFT: u8 = 4;
pub const VARIANT_BITS: u8 = 0x30;
pub const COLLECTABLE_SHIFT: u8 = 6;
pub const COLLECTABLE: u8 = 1 << COLLECTABLE_SHIFT;

/// Number of basic kinds that are first-class values.
pub const NUM_TAGS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BasicType {
    Nil = 0,
    Boolean = 1,
    LightUserData = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    UserData = 7,
    Thread = 8,
    Proto = 9,
    DeadKey = 10,
    /// Absence of a value, e.g. an out of range stack index.
    None = 0x80,
}

impl BasicType {
    pub const ALL: [BasicType; NUM_TAGS] = [
        BasicType::Nil,
        BasicType::Boolean,
        BasicType::LightUserData,
        BasicType::Number,
        BasicType::String,
        BasicType::Table,
        BasicType::Function,
        BasicType::UserData,
        BasicType::Thread,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BasicType::Nil => "nil",
            BasicType::Boolean => "boolean",
            BasicType::LightUserData => "userdata",
            BasicType::Number => "number",
            BasicType::String => "string",
            BasicType::Table => "table",
            BasicType::Function => "function",
            BasicType::UserData => "userdata",
            BasicType::Thread => "thread",
            BasicType::Proto => "proto",
            BasicType::DeadKey => "dead key",
            BasicType::None => "no value",
        }
    }

    /// Default variant of this kind.
    pub const fn variant(self) -> Variant {
        match self {
            BasicType::Nil => Variant::Nil,
            BasicType::Boolean => Variant::Boolean,
            BasicType::LightUserData => Variant::LightUserData,
            BasicType::Number => Variant::Float,
            BasicType::String => Variant::ShortString,
            BasicType::Table => Variant::Table,
            BasicType::Function => Variant::LuaClosure,
            BasicType::UserData => Variant::UserData,
            BasicType::Thread => Variant::Thread,
            BasicType::Proto => Variant::Proto,
            BasicType::DeadKey => Variant::DeadKey,
            BasicType::None => Variant::None,
        }
    }
}

/// Every kind/variant combination a tag may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Variant {
    Nil = 0x00,
    Boolean = 0x01,
    LightUserData = 0x02,
    Float = 0x03,
    Int = 0x13,
    ShortString = 0x04,
    LongString = 0x14,
    Table = 0x05,
    LuaClosure = 0x06,
    LightCFunction = 0x16,
    CClosure = 0x26,
    UserData = 0x07,
    Thread = 0x08,
    Proto = 0x09,
    DeadKey = 0x0A,
    None = 0x80,
}

impl Variant {
    pub const ALL: [Variant; 16] = [
        Variant::Nil,
        Variant::Boolean,
        Variant::LightUserData,
        Variant::Float,
        Variant::Int,
        Variant::ShortString,
        Variant::LongString,
        Variant::Table,
        Variant::LuaClosure,
        Variant::LightCFunction,
        Variant::CClosure,
        Variant::UserData,
        Variant::Thread,
        Variant::Proto,
        Variant::DeadKey,
        Variant::None,
    ];

    /// Strict decode of a byte without the heap-owned bit.
    pub const fn from_u8(raw: u8) -> Option<Variant> {
        Some(match raw {
            0x00 => Variant::Nil,
            0x01 => Variant::Boolean,
            0x02 => Variant::LightUserData,
            0x03 => Variant::Float,
            0x13 => Variant::Int,
            0x04 => Variant::ShortString,
            0x14 => Variant::LongString,
            0x05 => Variant::Table,
            0x06 => Variant::LuaClosure,
            0x16 => Variant::LightCFunction,
            0x26 => Variant::CClosure,
            0x07 => Variant::UserData,
            0x08 => Variant::Thread,
            0x09 => Variant::Proto,
            0x0A => Variant::DeadKey,
            0x80 => Variant::None,
            _ => return None,
        })
    }

    pub const fn basic(self) -> BasicType {
        match self {
            Variant::Nil => BasicType::Nil,
            Variant::Boolean => BasicType::Boolean,
            Variant::LightUserData => BasicType::LightUserData,
            Variant::Float | Variant::Int => BasicType::Number,
            Variant::ShortString | Variant::LongString => BasicType::String,
            Variant::Table => BasicType::Table,
            Variant::LuaClosure | Variant::LightCFunction | Variant::CClosure => {
                BasicType::Function
            }
            Variant::UserData => BasicType::UserData,
            Variant::Thread => BasicType::Thread,
            Variant::Proto => BasicType::Proto,
            Variant::DeadKey => BasicType::DeadKey,
            Variant::None => BasicType::None,
        }
    }

    /// Variant bits (bits 4-5) of the packed form.
    #[inline(always)]
    pub const fn variant_bits(self) -> u8 {
        (self as u8 & VARIANT_BITS) >> VARIANT_SHIFT
    }

    /// `true` for the kinds whose values live on the collected heap.
    pub const fn is_heap_kind(self) -> bool {
        matches!(
            self,
            Variant::ShortString
                | Variant::LongString
                | Variant::Table
                | Variant::LuaClosure
                | Variant::CClosure
                | Variant::UserData
                | Variant::Thread
                | Variant::Proto
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Variant::LightCFunction => "light C function",
            Variant::CClosure => "C function closure",
            Variant::LongString => "long string",
            Variant::Int => "int number",
            other => other.basic().name(),
        }
    }
}

/// A value's type: variant plus the heap-owned flag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LuaType {
    variant: Variant,
    collectable: bool,
}

impl LuaType {
    pub const NONE: LuaType = LuaType::new(Variant::None);
    pub const NIL: LuaType = LuaType::new(Variant::Nil);

    #[inline(always)]
    pub const fn new(variant: Variant) -> Self {
        Self {
            variant,
            collectable: false,
        }
    }

    /// Tag of a heap object of the given variant, with the heap-owned flag set.
    #[inline(always)]
    pub const fn heap(variant: Variant) -> Self {
        Self {
            variant,
            collectable: true,
        }
    }

    #[inline(always)]
    pub const fn basic(self) -> BasicType {
        self.variant.basic()
    }

    #[inline(always)]
    pub const fn variant(self) -> Variant {
        self.variant
    }

    #[inline(always)]
    pub const fn is_collectable(self) -> bool {
        self.collectable
    }

    #[inline(always)]
    pub fn set_collectable(&mut self) {
        self.collectable = true;
    }

    #[inline(always)]
    pub const fn as_collectable(self) -> Self {
        Self::heap(self.variant)
    }

    /// Basic kind, panicking if the tag carries variant or heap-owned bits.
    pub fn as_basic_strict(self) -> BasicType {
        let basic = self.basic();
        if self.collectable || self.variant != basic.variant() || self.variant.variant_bits() != 0 {
            panic!("type tag {:?} is not a plain basic kind", self);
        }
        basic
    }

    /// Variant, panicking if the heap-owned flag is set.
    pub fn as_variant_strict(self) -> Variant {
        if self.collectable {
            panic!("type tag {:?} carries the heap-owned bit", self);
        }
        self.variant
    }

    pub const fn to_raw(self) -> u8 {
        if self.collectable {
            self.variant as u8 | COLLECTABLE
        } else {
            self.variant as u8
        }
    }

    /// Strict decode of an untrusted byte.
    ///
    /// The heap-owned bit is only accepted on heap kinds; anything that is not one of the
    /// enumerated combinations is an [`LuaError::InvalidTag`].
    pub fn try_from_raw(raw: u8) -> LuaResult<Self> {
        let collectable = raw & COLLECTABLE != 0 && raw != Variant::None as u8;
        let variant = match Variant::from_u8(raw & !COLLECTABLE) {
            Some(variant) if !collectable || variant.is_heap_kind() => variant,
            _ => return Err(LuaError::InvalidTag(raw)),
        };
        Ok(Self {
            variant,
            collectable,
        })
    }

    /// Same as [`LuaType::try_from_raw`] for callers without an error channel: an invalid byte
    /// aborts the process.
    pub fn from_raw_or_abort(raw: u8) -> Self {
        match Self::try_from_raw(raw) {
            Ok(tag) => tag,
            Err(err) => {
                log::error!("{}", err);
                std::process::abort();
            }
        }
    }

    pub fn name(self) -> &'static str {
        self.variant.name()
    }
}

impl From<Variant> for LuaType {
    fn from(variant: Variant) -> Self {
        Self::new(variant)
    }
}

impl From<BasicType> for LuaType {
    fn from(basic: BasicType) -> Self {
        Self::new(basic.variant())
    }
}

impl PartialEq<Variant> for LuaType {
    fn eq(&self, other: &Variant) -> bool {
        !self.collectable && self.variant == *other
    }
}

impl PartialEq<BasicType> for LuaType {
    fn eq(&self, other: &BasicType) -> bool {
        !self.collectable && self.variant == other.variant()
    }
}

impl fmt::Debug for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.variant)?;
        if self.collectable {
            write!(f, "+gc")?;
        }
        Ok(())
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_kinds_round_trip() {
        for basic in BasicType::ALL {
            let raw = LuaType::from(basic).to_raw();
            assert_eq!(raw, basic as u8);
            assert_eq!(LuaType::try_from_raw(raw).unwrap().basic(), basic);
        }
    }

    #[test]
    fn unused_patterns_are_rejected() {
        for raw in [0x0Bu8, 0x0F, 0x11, 0x23, 0x36, 0x7F, 0x81, 0xFF] {
            assert!(matches!(LuaType::try_from_raw(raw), Err(LuaError::InvalidTag(r)) if r == raw));
        }
        // heap-owned bit on a scalar
        assert!(LuaType::try_from_raw(0x13 | COLLECTABLE).is_err());
        assert!(LuaType::try_from_raw(0x01 | COLLECTABLE).is_err());
    }

    #[test]
    fn collectable_bit_keeps_projections() {
        for variant in Variant::ALL.iter().copied().filter(|v| v.is_heap_kind()) {
            let plain = LuaType::new(variant);
            let gc = plain.as_collectable();
            assert_eq!(gc.basic(), plain.basic());
            assert_eq!(gc.variant(), plain.variant());
            assert_eq!(gc.to_raw(), variant as u8 | 0x40);
            assert_eq!(LuaType::try_from_raw(gc.to_raw()).unwrap(), gc);
        }
    }

    #[test]
    fn names() {
        assert_eq!(LuaType::new(Variant::Int).name(), "int number");
        assert_eq!(LuaType::new(Variant::Float).name(), "number");
        assert_eq!(LuaType::heap(Variant::ShortString).to_string(), "string");
        assert_eq!(LuaType::NONE.name(), "no value");
        assert_eq!(BasicType::LightUserData.name(), BasicType::UserData.name());
    }

    #[test]
    #[should_panic]
    fn strict_basic_rejects_variants() {
        LuaType::new(Variant::LongString).as_basic_strict();
    }
}
