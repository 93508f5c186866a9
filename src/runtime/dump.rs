//! Writer for precompiled chunks, the inverse of [`crate::runtime::undump`].

use std::io::Write;

use crate::{
    gc::GcRef,
    runtime::{
        error::LuaResult,
        object::Proto,
        state::GlobalState,
        undump::{LONG_LENGTH, LUAC_DATA, LUAC_FORMAT, LUAC_INT, LUAC_NUM, LUAC_VERSION, LUA_SIGNATURE, SIZE_CHECKS},
        value::TValue,
    },
};

struct DumpState<'a, W: Write> {
    g: &'a GlobalState,
    w: &'a mut W,
    strip: bool,
}

impl<'a, W: Write> DumpState<'a, W> {
    fn emit_bytes(&mut self, bytes: &[u8]) -> LuaResult<()> {
        self.w.write_all(bytes)?;
        Ok(())
    }

    fn emit_u8(&mut self, x: u8) -> LuaResult<()> {
        self.emit_bytes(&[x])
    }

    fn emit_int(&mut self, x: i32) -> LuaResult<()> {
        self.emit_bytes(&x.to_ne_bytes())
    }

    fn emit_count(&mut self, n: usize) -> LuaResult<()> {
        self.emit_int(n as i32)
    }

    fn emit_string(&mut self, s: Option<GcRef>) -> LuaResult<()> {
        let Some(s) = s else {
            return self.emit_u8(0);
        };
        let g = self.g;
        let bytes = g.heap.string(s).as_bytes();
        let size = bytes.len() + 1;
        if size < LONG_LENGTH as usize {
            self.emit_u8(size as u8)?;
        } else {
            self.emit_u8(LONG_LENGTH)?;
            self.emit_bytes(&(size as u64).to_ne_bytes())?;
        }
        self.emit_bytes(bytes)
    }

    fn emit_constants(&mut self, f: &Proto) -> LuaResult<()> {
        self.emit_count(f.k.len())?;
        for k in f.k.iter() {
            // constants carry the plain variant, never the heap-owned bit
            self.emit_u8(k.tag().variant() as u8)?;
            match *k {
                TValue::Nil => {}
                TValue::Boolean(b) => self.emit_u8(b as u8)?,
                TValue::Float(n) => self.emit_bytes(&n.to_ne_bytes())?,
                TValue::Int(i) => self.emit_bytes(&i.to_ne_bytes())?,
                TValue::ShortString(s) | TValue::LongString(s) => self.emit_string(Some(s))?,
                other => unreachable!("{:?} in a constant pool", other),
            }
        }
        Ok(())
    }

    fn emit_debug(&mut self, f: &Proto) -> LuaResult<()> {
        let n = if self.strip { 0 } else { f.lineinfo.len() };
        self.emit_count(n)?;
        for line in &f.lineinfo.as_slice()[..n] {
            self.emit_int(*line)?;
        }
        let n = if self.strip { 0 } else { f.locvars.len() };
        self.emit_count(n)?;
        for var in &f.locvars.as_slice()[..n] {
            self.emit_string(var.varname)?;
            self.emit_int(var.startpc)?;
            self.emit_int(var.endpc)?;
        }
        let n = if self.strip { 0 } else { f.upvalues.len() };
        self.emit_count(n)?;
        for desc in &f.upvalues.as_slice()[..n] {
            self.emit_string(desc.name)?;
        }
        Ok(())
    }

    fn emit_function(&mut self, p: GcRef, psource: Option<GcRef>) -> LuaResult<()> {
        let g = self.g;
        let f = g.heap.proto(p);
        if self.strip || f.source == psource {
            self.emit_string(None)?;
        } else {
            self.emit_string(f.source)?;
        }
        self.emit_int(f.linedefined)?;
        self.emit_int(f.lastlinedefined)?;
        self.emit_u8(f.numparams)?;
        self.emit_u8(f.is_vararg as u8)?;
        self.emit_u8(f.maxstacksize)?;

        self.emit_count(f.code.len())?;
        for word in f.code.iter() {
            self.emit_bytes(&word.to_ne_bytes())?;
        }
        self.emit_constants(f)?;
        self.emit_count(f.upvalues.len())?;
        for desc in f.upvalues.iter() {
            self.emit_u8(desc.instack as u8)?;
            self.emit_u8(desc.idx)?;
        }
        self.emit_count(f.p.len())?;
        for child in f.p.iter() {
            self.emit_function(*child, f.source)?;
        }
        self.emit_debug(f)
    }

    fn emit_header(&mut self) -> LuaResult<()> {
        self.emit_bytes(LUA_SIGNATURE)?;
        self.emit_u8(LUAC_VERSION)?;
        self.emit_u8(LUAC_FORMAT)?;
        self.emit_bytes(LUAC_DATA)?;
        for (_, size) in SIZE_CHECKS {
            self.emit_u8(size as u8)?;
        }
        self.emit_bytes(&LUAC_INT.to_ne_bytes())?;
        self.emit_bytes(&LUAC_NUM.to_ne_bytes())
    }
}

/// Writes the prototype `proto` and everything nested in it as a precompiled chunk. With
/// `strip` the debug information is left out.
pub fn dump<W: Write>(g: &GlobalState, proto: GcRef, w: &mut W, strip: bool) -> LuaResult<()> {
    let mut d = DumpState { g, w, strip };
    d.emit_header()?;
    let nupvalues = g.heap.proto(proto).upvalues.len();
    d.emit_u8(nupvalues as u8)?;
    d.emit_function(proto, None)?;
    d.w.flush()?;
    Ok(())
}
