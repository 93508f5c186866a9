//! Human readable listing of loaded prototypes, in the manner of `luac -l`.

use std::fmt::{self, Write};

use crate::{
    gc::GcRef,
    runtime::{object::Proto, state::GlobalState, value::TValue},
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    ABC,
    ABx,
    AsBx,
    Ax,
}

const OPCODES: [(&str, Mode); 47] = [
    ("MOVE", Mode::ABC),
    ("LOADK", Mode::ABx),
    ("LOADKX", Mode::ABC),
    ("LOADBOOL", Mode::ABC),
    ("LOADNIL", Mode::ABC),
    ("GETUPVAL", Mode::ABC),
    ("GETTABUP", Mode::ABC),
    ("GETTABLE", Mode::ABC),
    ("SETTABUP", Mode::ABC),
    ("SETUPVAL", Mode::ABC),
    ("SETTABLE", Mode::ABC),
    ("NEWTABLE", Mode::ABC),
    ("SELF", Mode::ABC),
    ("ADD", Mode::ABC),
    ("SUB", Mode::ABC),
    ("MUL", Mode::ABC),
    ("MOD", Mode::ABC),
    ("POW", Mode::ABC),
    ("DIV", Mode::ABC),
    ("IDIV", Mode::ABC),
    ("BAND", Mode::ABC),
    ("BOR", Mode::ABC),
    ("BXOR", Mode::ABC),
    ("SHL", Mode::ABC),
    ("SHR", Mode::ABC),
    ("UNM", Mode::ABC),
    ("BNOT", Mode::ABC),
    ("NOT", Mode::ABC),
    ("LEN", Mode::ABC),
    ("CONCAT", Mode::ABC),
    ("JMP", Mode::AsBx),
    ("EQ", Mode::ABC),
    ("LT", Mode::ABC),
    ("LE", Mode::ABC),
    ("TEST", Mode::ABC),
    ("TESTSET", Mode::ABC),
    ("CALL", Mode::ABC),
    ("TAILCALL", Mode::ABC),
    ("RETURN", Mode::ABC),
    ("FORLOOP", Mode::AsBx),
    ("FORPREP", Mode::AsBx),
    ("TFORCALL", Mode::ABC),
    ("TFORLOOP", Mode::AsBx),
    ("SETLIST", Mode::ABC),
    ("CLOSURE", Mode::ABx),
    ("VARARG", Mode::ABC),
    ("EXTRAARG", Mode::Ax),
];

const MAXARG_SBX: i32 = (1 << 17) - 1;

/// Formats one instruction word. Unknown opcodes are shown as raw words.
pub fn instruction(word: u32) -> String {
    let op = (word & 0x3F) as usize;
    let a = (word >> 6) & 0xFF;
    let c = (word >> 14) & 0x1FF;
    let b = (word >> 23) & 0x1FF;
    let bx = word >> 14;
    let Some(&(name, mode)) = OPCODES.get(op) else {
        return format!("<op {}>", op);
    };
    match mode {
        Mode::ABC => format!("{:<9} {} {} {}", name, a, b, c),
        Mode::ABx => format!("{:<9} {} {}", name, a, bx),
        Mode::AsBx => format!("{:<9} {} {}", name, a, bx as i32 - MAXARG_SBX),
        Mode::Ax => format!("{:<9} {}", name, word >> 6),
    }
}

fn text(g: &GlobalState, s: Option<GcRef>) -> String {
    match s {
        Some(s) => g.heap.string(s).to_str_lossy().into_owned(),
        None => "?".to_string(),
    }
}

fn constant(g: &GlobalState, k: TValue) -> String {
    match k {
        TValue::Nil => "nil".to_string(),
        TValue::Boolean(b) => b.to_string(),
        TValue::Int(i) => i.to_string(),
        TValue::Float(n) if n.fract() == 0.0 && n.is_finite() => format!("{:.1}", n),
        TValue::Float(n) => n.to_string(),
        TValue::ShortString(s) | TValue::LongString(s) => format!("{:?}", text(g, Some(s))),
        other => format!("{:?}", other),
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn header<W: Write>(g: &GlobalState, f: &Proto, main: bool, out: &mut W) -> fmt::Result {
    let source = match f.source {
        Some(s) => {
            let name = text(g, Some(s));
            match name.strip_prefix('@').or_else(|| name.strip_prefix('=')) {
                Some(stripped) => stripped.to_string(),
                None => name,
            }
        }
        None => "=?".to_string(),
    };
    writeln!(
        out,
        "\n{} <{}:{},{}> ({} instruction{})",
        if main { "main" } else { "function" },
        source,
        f.linedefined,
        f.lastlinedefined,
        f.code.len(),
        plural(f.code.len())
    )?;
    writeln!(
        out,
        "{}{} param{}, {} slot{}, {} upvalue{}, {} local{}, {} constant{}, {} function{}",
        f.numparams,
        if f.is_vararg { "+" } else { "" },
        plural(f.numparams as usize),
        f.maxstacksize,
        plural(f.maxstacksize as usize),
        f.upvalues.len(),
        plural(f.upvalues.len()),
        f.locvars.len(),
        plural(f.locvars.len()),
        f.k.len(),
        plural(f.k.len()),
        f.p.len(),
        plural(f.p.len())
    )
}

fn code<W: Write>(f: &Proto, out: &mut W) -> fmt::Result {
    for (pc, word) in f.code.iter().enumerate() {
        let line = match f.lineinfo.as_slice().get(pc) {
            Some(line) => line.to_string(),
            None => "-".to_string(),
        };
        writeln!(out, "\t{}\t[{}]\t{:08x}\t{}", pc + 1, line, word, instruction(*word))?;
    }
    Ok(())
}

fn debug<W: Write>(g: &GlobalState, f: &Proto, out: &mut W) -> fmt::Result {
    writeln!(out, "constants ({}):", f.k.len())?;
    for (i, k) in f.k.iter().enumerate() {
        writeln!(out, "\t{}\t{}", i + 1, constant(g, *k))?;
    }
    writeln!(out, "locals ({}):", f.locvars.len())?;
    for (i, var) in f.locvars.iter().enumerate() {
        writeln!(
            out,
            "\t{}\t{}\t{}\t{}",
            i,
            text(g, var.varname),
            var.startpc + 1,
            var.endpc + 1
        )?;
    }
    writeln!(out, "upvalues ({}):", f.upvalues.len())?;
    for (i, desc) in f.upvalues.iter().enumerate() {
        writeln!(
            out,
            "\t{}\t{}\t{}\t{}",
            i,
            text(g, desc.name),
            desc.instack as u8,
            desc.idx
        )?;
    }
    Ok(())
}

fn list_function<W: Write>(
    g: &GlobalState,
    p: GcRef,
    main: bool,
    full: bool,
    out: &mut W,
) -> fmt::Result {
    let f = g.heap.proto(p);
    header(g, f, main, out)?;
    code(f, out)?;
    if full {
        debug(g, f, out)?;
    }
    for child in f.p.iter() {
        list_function(g, *child, false, full, out)?;
    }
    Ok(())
}

/// Writes the listing of `proto` and its nested prototypes. `full` adds constants, locals
/// and upvalues.
pub fn list<W: Write>(g: &GlobalState, proto: GcRef, full: bool, out: &mut W) -> fmt::Result {
    list_function(g, proto, true, full, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{fun, state::State, string};

    #[test]
    fn instruction_formats() {
        // RETURN 0 1 0
        assert_eq!(instruction(0x0080_0026), "RETURN    0 1 0");
        // LOADK 1 2
        assert_eq!(instruction(1 | (1 << 6) | (2 << 14)), "LOADK     1 2");
        // JMP 0 -1
        assert_eq!(instruction(30 | ((MAXARG_SBX as u32 - 1) << 14)), "JMP       0 -1");
        assert_eq!(instruction(63), "<op 63>");
    }

    #[test]
    fn lists_nested_functions() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let source = string::new_str(g, "@demo.lua").unwrap();
        let root = fun::new_proto(g).unwrap();
        let child = fun::new_proto(g).unwrap();
        let code = g.mem.new_vector(1, 0x0080_0026u32).unwrap();
        let k = g.mem.new_vector(2, TValue::Float(1.0)).unwrap();
        let nested = g.mem.new_vector(1, child).unwrap();
        {
            let p = g.heap.proto_mut(root);
            p.source = Some(source);
            p.is_vararg = true;
            p.maxstacksize = 2;
            p.code = code;
            p.k = k;
            p.p = nested;
        }
        g.heap.proto_mut(child).source = Some(source);

        let mut out = String::new();
        list(g, root, true, &mut out).unwrap();
        assert!(out.contains("main <demo.lua:0,0> (1 instruction)"));
        assert!(out.contains("0+ params, 2 slots, 0 upvalues, 0 locals, 2 constants, 1 function"));
        assert!(out.contains("\t1\t[-]\t00800026\tRETURN    0 1 0"));
        assert!(out.contains("constants (2):\n\t1\t1.0\n\t2\t1.0"));
        assert!(out.contains("function <demo.lua:0,0> (0 instructions)"));
    }
}
