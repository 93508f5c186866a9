//! Loader for precompiled chunks.
//!
//! All multi-byte fields are in native byte order and native widths; the header rejects
//! chunks produced for a different layout.

use std::io::{self, Read};

use slotmap::Key;

use crate::{
    gc::{
        self,
        memory::{LVec, Pod},
        GcRef,
    },
    runtime::{
        control::run_protected,
        error::{LuaError, LuaResult, MalformedReason},
        fun,
        ltype::{LuaType, Variant},
        object::{LocVar, Upvaldesc, MAX_SHORT_LEN},
        state::GlobalState,
        string,
        value::{TValue, ThreadId},
    },
};

pub const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const LUAC_VERSION: u8 = 0x53;
pub const LUAC_FORMAT: u8 = 0;
pub const LUAC_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
pub const LUAC_INT: i64 = 0x5678;
pub const LUAC_NUM: f64 = 370.5;

/// Width checks of the header, in order.
pub const SIZE_CHECKS: [(&str, usize); 5] = [
    ("int", std::mem::size_of::<i32>()),
    ("size_t", std::mem::size_of::<usize>()),
    ("Instruction", std::mem::size_of::<u32>()),
    ("lua_Integer", std::mem::size_of::<i64>()),
    ("lua_Number", std::mem::size_of::<f64>()),
];

/// Length byte announcing a full-width length.
pub const LONG_LENGTH: u8 = 0xFF;

/// Elements read before the first reallocation of a vector filled from the stream. Later
/// batches double the vector, so a declared count never costs more than twice the bytes
/// actually present.
const LOAD_BATCH: usize = 1024;

/// Name used in messages about a chunk called `name`.
pub fn chunk_name(name: &str) -> &str {
    match name.as_bytes().first() {
        Some(b'@') | Some(b'=') => &name[1..],
        Some(&c) if c == LUA_SIGNATURE[0] => "binary string",
        _ => name,
    }
}

struct LoadState<'a, R: Read> {
    g: &'a mut GlobalState,
    z: &'a mut R,
    name: &'a str,
}

impl<'a, R: Read> LoadState<'a, R> {
    fn error(&self, reason: MalformedReason) -> LuaError {
        log::debug!(target: "undump", "{}: rejected, {}", self.name, reason);
        LuaError::malformed(self.name, reason)
    }

    fn load_block(&mut self, buf: &mut [u8]) -> LuaResult<()> {
        read_into(&mut *self.z, self.name, buf)
    }

    fn load_byte(&mut self) -> LuaResult<u8> {
        let mut buf = [0u8; 1];
        self.load_block(&mut buf)?;
        Ok(buf[0])
    }

    fn load_int(&mut self) -> LuaResult<i32> {
        let mut buf = [0u8; 4];
        self.load_block(&mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    /// An element count: a non-negative int.
    fn load_count(&mut self) -> LuaResult<usize> {
        let n = self.load_int()?;
        if n < 0 {
            return Err(self.error(MalformedReason::Corrupted));
        }
        Ok(n as usize)
    }

    /// `n` plain elements read straight into their storage, which only grows as the data
    /// arrives.
    fn load_vector<T: Pod + Default>(&mut self, n: usize) -> LuaResult<LVec<T>> {
        let mut vec = LVec::empty();
        while vec.len() < n {
            let done = vec.byte_size();
            let len = (vec.len() * 2).max(LOAD_BATCH).min(n);
            let read = match self.g.mem.resize_vector(&mut vec, len, T::default()) {
                Ok(()) => read_into(&mut *self.z, self.name, &mut vec.as_bytes_mut()[done..]),
                Err(err) => Err(err),
            };
            if let Err(err) = read {
                self.g.mem.free_vector(&mut vec);
                return Err(err);
            }
        }
        Ok(vec)
    }

    fn load_size(&mut self) -> LuaResult<usize> {
        let mut buf = [0u8; 8];
        self.load_block(&mut buf)?;
        Ok(u64::from_ne_bytes(buf) as usize)
    }

    fn load_integer(&mut self) -> LuaResult<i64> {
        let mut buf = [0u8; 8];
        self.load_block(&mut buf)?;
        Ok(i64::from_ne_bytes(buf))
    }

    fn load_number(&mut self) -> LuaResult<f64> {
        let mut buf = [0u8; 8];
        self.load_block(&mut buf)?;
        Ok(f64::from_ne_bytes(buf))
    }

    /// Text, or `None` for the absent text.
    fn load_string(&mut self) -> LuaResult<Option<GcRef>> {
        let mut size = self.load_byte()? as usize;
        if size == LONG_LENGTH as usize {
            size = self.load_size()?;
        }
        if size == 0 {
            return Ok(None);
        }
        let len = size - 1;
        if len <= MAX_SHORT_LEN {
            let mut buf = [0u8; MAX_SHORT_LEN];
            self.load_block(&mut buf[..len])?;
            Ok(Some(string::new_lstr(self.g, &buf[..len])?))
        } else {
            // the object is only created once the whole text is there
            let mut buf = self.load_vector::<u8>(len)?;
            let s = string::new_lstr(self.g, buf.as_slice());
            self.g.mem.free_vector(&mut buf);
            Ok(Some(s?))
        }
    }

    fn load_code(&mut self, f: GcRef) -> LuaResult<()> {
        let n = self.load_count()?;
        let code = self.load_vector::<u32>(n)?;
        self.g.heap.proto_mut(f).code = code;
        Ok(())
    }

    fn load_constants(&mut self, f: GcRef) -> LuaResult<()> {
        let n = self.load_count()?;
        let k = self.g.mem.new_vector(n, TValue::Nil)?;
        self.g.heap.proto_mut(f).k = k;
        for i in 0..n {
            let raw = self.load_byte()?;
            let tag = LuaType::try_from_raw(raw)?;
            if tag.is_collectable() {
                return Err(self.error(MalformedReason::UnknownConstant(raw)));
            }
            let value = match tag.variant() {
                Variant::Nil => TValue::Nil,
                Variant::Boolean => TValue::Boolean(self.load_byte()? != 0),
                Variant::Float => TValue::Float(self.load_number()?),
                Variant::Int => TValue::Int(self.load_integer()?),
                Variant::ShortString | Variant::LongString => match self.load_string()? {
                    Some(s) => string::value(self.g, s),
                    None => return Err(self.error(MalformedReason::NullConstantText)),
                },
                _ => return Err(self.error(MalformedReason::UnknownConstant(raw))),
            };
            gc::check_liveness(self.g, &value);
            self.g.heap.proto_mut(f).k[i] = value;
        }
        Ok(())
    }

    fn load_upvalues(&mut self, f: GcRef) -> LuaResult<()> {
        let n = self.load_count()?;
        let upvalues = self.g.mem.new_vector(n, Upvaldesc::default())?;
        self.g.heap.proto_mut(f).upvalues = upvalues;
        for i in 0..n {
            let instack = self.load_byte()? != 0;
            let idx = self.load_byte()?;
            let desc = &mut self.g.heap.proto_mut(f).upvalues[i];
            desc.instack = instack;
            desc.idx = idx;
        }
        Ok(())
    }

    fn load_protos(&mut self, f: GcRef) -> LuaResult<()> {
        let n = self.load_count()?;
        let p = self.g.mem.new_vector(n, GcRef::null())?;
        self.g.heap.proto_mut(f).p = p;
        let source = self.g.heap.proto(f).source;
        for i in 0..n {
            let child = fun::new_proto(self.g)?;
            gc::check_reference(self.g, child, Variant::Proto);
            self.g.heap.proto_mut(f).p[i] = child;
            self.load_function(child, source)?;
        }
        Ok(())
    }

    fn load_debug(&mut self, f: GcRef) -> LuaResult<()> {
        let n = self.load_count()?;
        let lineinfo = self.load_vector::<i32>(n)?;
        self.g.heap.proto_mut(f).lineinfo = lineinfo;

        let n = self.load_count()?;
        let locvars = self.g.mem.new_vector(n, LocVar::default())?;
        self.g.heap.proto_mut(f).locvars = locvars;
        for i in 0..n {
            let varname = self.load_string()?;
            let startpc = self.load_int()?;
            let endpc = self.load_int()?;
            self.g.heap.proto_mut(f).locvars[i] = LocVar {
                varname,
                startpc,
                endpc,
            };
        }

        // names of the upvalues read earlier
        let n = self.load_count()?;
        if n > self.g.heap.proto(f).upvalues.len() {
            return Err(self.error(MalformedReason::BadUpvalueNames));
        }
        for i in 0..n {
            let name = self.load_string()?;
            self.g.heap.proto_mut(f).upvalues[i].name = name;
        }
        Ok(())
    }

    fn load_function(&mut self, f: GcRef, psource: Option<GcRef>) -> LuaResult<()> {
        let source = self.load_string()?.or(psource);
        let linedefined = self.load_int()?;
        let lastlinedefined = self.load_int()?;
        let numparams = self.load_byte()?;
        let is_vararg = self.load_byte()? != 0;
        let maxstacksize = self.load_byte()?;
        {
            let p = self.g.heap.proto_mut(f);
            p.source = source;
            p.linedefined = linedefined;
            p.lastlinedefined = lastlinedefined;
            p.numparams = numparams;
            p.is_vararg = is_vararg;
            p.maxstacksize = maxstacksize;
        }
        self.load_code(f)?;
        self.load_constants(f)?;
        self.load_upvalues(f)?;
        self.load_protos(f)?;
        self.load_debug(f)
    }

    fn check_literal(&mut self, expected: &[u8], reason: MalformedReason) -> LuaResult<()> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..expected.len()];
        self.load_block(buf)?;
        if buf != expected {
            return Err(self.error(reason));
        }
        Ok(())
    }

    fn check_header(&mut self) -> LuaResult<()> {
        self.check_literal(LUA_SIGNATURE, MalformedReason::NotAChunk)?;
        if self.load_byte()? != LUAC_VERSION {
            return Err(self.error(MalformedReason::VersionMismatch));
        }
        if self.load_byte()? != LUAC_FORMAT {
            return Err(self.error(MalformedReason::FormatMismatch));
        }
        self.check_literal(LUAC_DATA, MalformedReason::Corrupted)?;
        for (what, size) in SIZE_CHECKS {
            if self.load_byte()? as usize != size {
                return Err(self.error(MalformedReason::SizeMismatch(what)));
            }
        }
        if self.load_integer()? != LUAC_INT {
            return Err(self.error(MalformedReason::EndiannessMismatch));
        }
        if self.load_number()? != LUAC_NUM {
            return Err(self.error(MalformedReason::FloatFormatMismatch));
        }
        Ok(())
    }
}

fn read_into<R: Read>(z: &mut R, name: &str, buf: &mut [u8]) -> LuaResult<()> {
    match z.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(LuaError::malformed(name, MalformedReason::Truncated))
        }
        Err(err) => Err(LuaError::Io(err)),
    }
}

/// Decodes a precompiled chunk into a new Lua closure, left on the stack of `th`.
///
/// Nothing is rolled back on failure: whatever was created is already linked in the heap
/// and goes away with the other unreachable objects.
pub fn undump<R: Read>(
    g: &mut GlobalState,
    th: ThreadId,
    z: &mut R,
    name: &str,
) -> LuaResult<GcRef> {
    let name = chunk_name(name);
    let mut s = LoadState { g, z, name };
    s.check_header()?;
    let nupvalues = s.load_byte()? as usize;
    let cl = fun::new_lclosure(s.g, nupvalues)?;
    // anchor before anything else is allocated
    s.g.push(th, TValue::LuaClosure(cl))?;
    let p = fun::new_proto(s.g)?;
    s.g.heap.lclosure_mut(cl).proto = Some(p);
    s.load_function(p, None)?;

    let declared = s.g.heap.proto(p).upvalues.len();
    if declared != nupvalues {
        log::error!(
            target: "undump",
            "{}: closure has {} upvalues, its prototype {}",
            name,
            nupvalues,
            declared
        );
        return Err(s.error(MalformedReason::UpvalueMismatch));
    }
    log::trace!(target: "undump", "{}: loaded, {} bytes in use", name, s.g.mem.total_bytes());
    Ok(cl)
}

/// Loads a precompiled chunk as a protected call on `th`. The new closure is left on the
/// stack with fresh upvalues, the first one holding the globals table. On failure the error
/// message is on the stack instead.
pub fn load<R: Read>(
    g: &mut GlobalState,
    th: ThreadId,
    z: &mut R,
    chunkname: &str,
) -> LuaResult<GcRef> {
    let cl = run_protected(g, th, |g| {
        let cl = undump(g, th, z, chunkname)?;
        fun::init_upvals(g, cl)?;
        Ok(cl)
    })?;
    if let Some(Some(env)) = g.heap.lclosure(cl).upvals.iter().next().copied() {
        let globals = g.globals();
        fun::upval_set(g, env, TValue::Table(globals));
    }
    Ok(cl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{dump, state::State};

    fn header() -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(LUA_SIGNATURE);
        out.push(LUAC_VERSION);
        out.push(LUAC_FORMAT);
        out.extend_from_slice(LUAC_DATA);
        for (_, size) in SIZE_CHECKS {
            out.push(size as u8);
        }
        out.extend_from_slice(&LUAC_INT.to_ne_bytes());
        out.extend_from_slice(&LUAC_NUM.to_ne_bytes());
        out
    }

    fn int(out: &mut Vec<u8>, x: i32) {
        out.extend_from_slice(&x.to_ne_bytes());
    }

    /// Main function `return` with one upvalue and the given constants.
    fn chunk(constants: &[u8], nconstants: i32) -> Vec<u8> {
        let mut out = header();
        out.push(1);
        out.push(b"@t.lua".len() as u8 + 1);
        out.extend_from_slice(b"@t.lua");
        int(&mut out, 0);
        int(&mut out, 0);
        out.extend_from_slice(&[0, 1, 2]);
        int(&mut out, 1);
        int(&mut out, 0x0080_0026);
        int(&mut out, nconstants);
        out.extend_from_slice(constants);
        int(&mut out, 1);
        out.extend_from_slice(&[1, 0]);
        int(&mut out, 0);
        int(&mut out, 1);
        int(&mut out, 1);
        int(&mut out, 0);
        int(&mut out, 1);
        out.push(b"_ENV".len() as u8 + 1);
        out.extend_from_slice(b"_ENV");
        out
    }

    #[test]
    fn chunk_names() {
        assert_eq!(chunk_name("@file.lua"), "file.lua");
        assert_eq!(chunk_name("=stdin"), "stdin");
        assert_eq!(chunk_name("\x1bLua"), "binary string");
        assert_eq!(chunk_name("plain"), "plain");
        assert_eq!(chunk_name(""), "");
    }

    #[test]
    fn loads_a_minimal_chunk() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let mut constants = vec![Variant::Int as u8];
        constants.extend_from_slice(&42i64.to_ne_bytes());
        let bytes = chunk(&constants, 1);
        let cl = load(g, ThreadId::Main, &mut &bytes[..], "=test").unwrap();

        let p = g.heap.lclosure(cl).proto().unwrap();
        let proto = g.heap.proto(p);
        assert_eq!(proto.code.as_slice(), &[0x0080_0026]);
        assert_eq!(proto.k[0], TValue::Int(42));
        assert_eq!(proto.maxstacksize, 2);
        assert!(proto.is_vararg);
        assert_eq!(proto.lineinfo.as_slice(), &[1]);
        let source = proto.source.unwrap();
        assert_eq!(g.heap.string(source).as_bytes(), b"@t.lua");
        let env_name = proto.upvalues[0].name.unwrap();
        assert_eq!(g.heap.string(env_name).as_bytes(), b"_ENV");

        let env = g.heap.lclosure(cl).upvalue(0).unwrap();
        assert_eq!(fun::upval_get(g, env), TValue::Table(g.globals()));
        assert_eq!(
            g.mainthread.stack().last(),
            Some(&TValue::LuaClosure(cl))
        );
    }

    #[test]
    fn header_failures() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let good = chunk(&[], 0);
        let cases: Vec<(usize, MalformedReason)> = vec![
            (1, MalformedReason::NotAChunk),
            (4, MalformedReason::VersionMismatch),
            (5, MalformedReason::FormatMismatch),
            (8, MalformedReason::Corrupted),
            (12, MalformedReason::SizeMismatch("int")),
            (13, MalformedReason::SizeMismatch("size_t")),
            (16, MalformedReason::SizeMismatch("lua_Number")),
            (17, MalformedReason::EndiannessMismatch),
            (25 + 7, MalformedReason::FloatFormatMismatch),
        ];
        for (offset, reason) in cases {
            let mut bytes = good.clone();
            bytes[offset] ^= 0x01;
            let err = load(g, ThreadId::Main, &mut &bytes[..], "bad").unwrap_err();
            assert_eq!(err.reason(), Some(reason), "byte {}", offset);
        }
    }

    #[test]
    fn truncated_everywhere() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let good = chunk(&[], 0);
        for len in 0..good.len() {
            let err = load(g, ThreadId::Main, &mut &good[..len], "short").unwrap_err();
            assert_eq!(
                err.reason(),
                Some(MalformedReason::Truncated),
                "length {}",
                len
            );
        }
        g.mem.check_accounting();
    }

    #[test]
    fn constant_tags() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let bytes = chunk(&[Variant::Table as u8], 1);
        let err = load(g, ThreadId::Main, &mut &bytes[..], "k").unwrap_err();
        assert_eq!(
            err.reason(),
            Some(MalformedReason::UnknownConstant(Variant::Table as u8))
        );

        let bytes = chunk(&[0x0C], 1);
        let err = load(g, ThreadId::Main, &mut &bytes[..], "k").unwrap_err();
        assert!(matches!(err, LuaError::InvalidTag(0x0C)));

        let bytes = chunk(&[Variant::ShortString as u8, 0], 1);
        let err = load(g, ThreadId::Main, &mut &bytes[..], "k").unwrap_err();
        assert_eq!(err.reason(), Some(MalformedReason::NullConstantText));
    }

    #[test]
    fn too_many_upvalue_names() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let mut bytes = chunk(&[], 0);
        // replace the trailing name count and name
        bytes.truncate(bytes.len() - 4 - 5);
        int(&mut bytes, 2);
        bytes.extend_from_slice(&[5, b'_', b'E', b'N', b'V', 2, b'x']);
        let err = load(g, ThreadId::Main, &mut &bytes[..], "names").unwrap_err();
        assert_eq!(err.reason(), Some(MalformedReason::BadUpvalueNames));
    }

    #[test]
    fn dumped_chunk_loads_back() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let bytes = chunk(&[Variant::Boolean as u8, 1], 1);
        let cl = load(g, ThreadId::Main, &mut &bytes[..], "=first").unwrap();
        let p = g.heap.lclosure(cl).proto().unwrap();
        let mut out = vec![];
        dump::dump(g, p, &mut out, false).unwrap();
        assert_eq!(out, bytes);
    }
}
