use lunar::gc::GcRef;
use lunar::runtime::{
    dump::dump,
    error::{LuaError, MalformedReason, Status},
    state::State,
    string,
    undump::{self, LUAC_DATA, LUAC_FORMAT, LUAC_INT, LUAC_NUM, LUAC_VERSION, LUA_SIGNATURE, SIZE_CHECKS},
    value::{TValue, ThreadId},
};

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

fn text(out: &mut Vec<u8>, s: &[u8]) {
    if s.len() + 1 < 0xFF {
        out.push(s.len() as u8 + 1);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(s.len() as u64 + 1).to_ne_bytes());
    }
    out.extend_from_slice(s);
}

/// Chunk whose main function returns and holds the sample constant pool.
fn sample_chunk() -> Vec<u8> {
    let long = "ab".repeat(40);
    let mut out = header();
    out.push(1);
    text(&mut out, b"@sample.lua");
    int(&mut out, 0);
    int(&mut out, 0);
    out.extend_from_slice(&[0, 1, 2]);
    // code: LOADK 0 0, RETURN 0 1
    int(&mut out, 2);
    out.extend_from_slice(&0x0000_0001u32.to_ne_bytes());
    out.extend_from_slice(&0x0080_0026u32.to_ne_bytes());
    // constants
    int(&mut out, 6);
    out.push(0x00);
    out.extend_from_slice(&[0x01, 1]);
    out.push(0x03);
    out.extend_from_slice(&3.25f64.to_ne_bytes());
    out.push(0x13);
    out.extend_from_slice(&42i64.to_ne_bytes());
    out.push(0x04);
    text(&mut out, b"ab");
    out.push(0x14);
    text(&mut out, long.as_bytes());
    // one upvalue, in the enclosing stack at 0
    int(&mut out, 1);
    out.extend_from_slice(&[1, 0]);
    // no nested functions
    int(&mut out, 0);
    // debug: two lines, no locals, one upvalue name
    int(&mut out, 2);
    int(&mut out, 1);
    int(&mut out, 1);
    int(&mut out, 0);
    int(&mut out, 1);
    text(&mut out, b"_ENV");
    out
}

/// Offset of the instruction vector in [`sample_chunk`].
fn code_offset() -> usize {
    header().len() + 1 + 1 + b"@sample.lua".len() + 4 + 4 + 3 + 4
}

#[test]
fn constant_pool_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let bytes = sample_chunk();
    let cl = undump::load(g, ThreadId::Main, &mut &bytes[..], "@sample.lua").unwrap();
    let p = g.objects().lclosure(cl).proto().unwrap();

    let separate = string::new_str(g, "ab").unwrap();
    let proto = g.objects().proto(p);
    let k = proto.k.as_slice();
    assert_eq!(k.len(), 6);
    assert_eq!(k[0], TValue::Nil);
    assert_eq!(k[1], TValue::Boolean(true));
    assert!(matches!(k[2], TValue::Float(x) if x == 3.25));
    assert!(matches!(k[3], TValue::Int(42)));
    // short strings are interned: the loaded one is the one we just made
    assert!(matches!(k[4], TValue::ShortString(s) if s == separate));
    match k[5] {
        TValue::LongString(s) => {
            assert_eq!(g.objects().string(s).as_bytes(), "ab".repeat(40).as_bytes())
        }
        other => panic!("expected a long string, got {:?}", other),
    }
    assert_eq!(proto.code.as_slice(), &[0x0000_0001, 0x0080_0026]);
    assert_eq!(proto.maxstacksize, 2);
    assert!(proto.is_vararg);
    let name = proto.upvalues[0].name.unwrap();
    assert_eq!(g.objects().string(name).as_bytes(), b"_ENV");

    // the first upvalue holds the globals
    let env = g.objects().lclosure(cl).upvalue(0).unwrap();
    assert_eq!(lunar::runtime::fun::upval_get(g, env), TValue::Table(g.globals()));
    g.memory().check_accounting();
}

#[test]
fn short_constants_are_shared_between_chunks() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let bytes = sample_chunk();
    let first = undump::load(g, ThreadId::Main, &mut &bytes[..], "=first").unwrap();
    let second = undump::load(g, ThreadId::Main, &mut &bytes[..], "=second").unwrap();
    assert_ne!(first, second);
    let k = |cl: GcRef| {
        let p = g.objects().lclosure(cl).proto().unwrap();
        (g.objects().proto(p).k[4], g.objects().proto(p).k[5])
    };
    let (short1, long1) = k(first);
    let (short2, long2) = k(second);
    assert!(matches!(short1, TValue::ShortString(_)));
    assert_eq!(short1, short2);
    // long strings are never interned
    assert_ne!(long1.string(), long2.string());
}

#[test]
fn dump_reproduces_the_chunk() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let bytes = sample_chunk();
    let cl = undump::load(g, ThreadId::Main, &mut &bytes[..], "@sample.lua").unwrap();
    let p = g.objects().lclosure(cl).proto().unwrap();
    let mut out = vec![];
    dump(g, p, &mut out, false).unwrap();
    assert_eq!(out, bytes);

    let mut stripped = vec![];
    dump(g, p, &mut stripped, true).unwrap();
    let cl = undump::load(g, ThreadId::Main, &mut &stripped[..], "=stripped").unwrap();
    let p = g.objects().lclosure(cl).proto().unwrap();
    let proto = g.objects().proto(p);
    assert!(proto.source.is_none());
    assert!(proto.lineinfo.is_empty());
    assert_eq!(proto.upvalues.len(), 1);
    assert!(proto.upvalues[0].name.is_none());
}

#[test]
fn newer_version_is_refused_without_leaking() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let before = g.memory().total_bytes();
    let top = g.thread(ThreadId::Main).top();
    let mut bytes = sample_chunk();
    bytes[LUA_SIGNATURE.len()] += 1;
    let err = undump::load(g, ThreadId::Main, &mut &bytes[..], "=newer").unwrap_err();
    assert!(matches!(
        err,
        LuaError::Malformed {
            reason: MalformedReason::VersionMismatch,
            ..
        }
    ));
    assert_eq!(err.status(), Status::ErrSyntax);
    assert_eq!(err.to_string(), "newer: version mismatch in precompiled chunk");
    // the message sits where the closure would have been
    let main = g.thread(ThreadId::Main);
    assert_eq!(main.top(), top + 1);
    assert!(main.stack()[top].is_string());
    g.memory().check_accounting();
    assert_eq!(g.memory().allocator_in_use(), Some(g.memory().total_bytes()));
    assert!(g.memory().total_bytes() >= before);
}

#[test]
fn truncated_code_is_reported() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let bytes = sample_chunk();
    // cut in the middle of the second instruction
    let cut = &bytes[..code_offset() + 6];
    let err = undump::load(g, ThreadId::Main, &mut &cut[..], "=cut").unwrap_err();
    assert!(matches!(
        err,
        LuaError::Malformed {
            reason: MalformedReason::Truncated,
            ..
        }
    ));
    assert_eq!(err.to_string(), "cut: truncated precompiled chunk");
    g.memory().check_accounting();
}

#[test]
fn source_text_is_not_a_chunk() {
    let mut state = State::new().unwrap();
    let err = undump::load(&mut state, ThreadId::Main, &mut &b"return 1"[..], "@src.lua")
        .unwrap_err();
    assert_eq!(err.to_string(), "src.lua: not a precompiled chunk");
}

#[test]
fn upvalue_count_must_match_the_prototype() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let top = g.thread(ThreadId::Main).top();
    let mut bytes = sample_chunk();
    bytes[header().len()] = 2;
    let err = undump::load(g, ThreadId::Main, &mut &bytes[..], "=mm").unwrap_err();
    assert_eq!(err.reason(), Some(MalformedReason::UpvalueMismatch));
    assert_eq!(err.status(), Status::ErrSyntax);
    assert_eq!(err.to_string(), "mm: upvalue count mismatch in precompiled chunk");
    assert_eq!(g.thread(ThreadId::Main).top(), top + 1);
    g.memory().check_accounting();
}

#[test]
fn huge_declared_counts_cost_no_more_than_the_input() {
    let mut state = State::new().unwrap();
    let g = &mut *state;
    let before = g.memory().total_bytes();

    let mut code = sample_chunk();
    code.truncate(code_offset() - 4);
    int(&mut code, 0x0800_0000);
    code.extend_from_slice(&[0x26, 0, 0x80, 0]);

    let mut long = header();
    long.push(1);
    text(&mut long, b"@huge.lua");
    int(&mut long, 0);
    int(&mut long, 0);
    long.extend_from_slice(&[0, 1, 2]);
    int(&mut long, 0);
    int(&mut long, 1);
    long.push(0x14);
    long.push(0xFF);
    long.extend_from_slice(&(1u64 << 31).to_ne_bytes());
    long.extend_from_slice(b"only a few bytes");

    for bytes in [code, long] {
        let err = undump::load(g, ThreadId::Main, &mut &bytes[..], "=huge").unwrap_err();
        assert_eq!(err.reason(), Some(MalformedReason::Truncated));
        assert!(g.memory().total_bytes() - before < 64 * 1024);
        g.memory().check_accounting();
    }
}
