//! Protected boundaries.
//!
//! Errors travel as `Err` values. A protected call records a [`ProtectMarker`] on the thread;
//! when an error comes back, [`unwind_to`] puts the thread back where the marker says and
//! leaves the error message on the stack.

use crate::runtime::{
    error::{LuaError, LuaResult},
    fun,
    state::{CiId, GlobalState},
    string,
    value::{TValue, ThreadId},
};

/// Thread registers saved when entering a protected call.
#[derive(Debug, Clone, Copy)]
pub struct ProtectMarker {
    pub old_top: usize,
    pub old_ci: CiId,
    pub old_nny: u16,
    pub old_errfunc: usize,
    pub old_allowhook: bool,
}

impl ProtectMarker {
    fn save(g: &GlobalState, th: ThreadId) -> Self {
        let thread = g.thread(th);
        Self {
            old_top: thread.top,
            old_ci: thread.ci,
            old_nny: thread.nny,
            old_errfunc: thread.errfunc,
            old_allowhook: thread.allowhook,
        }
    }
}

/// Runs `f` as a protected call on thread `th`. On failure the thread is unwound to its
/// state at entry, with the error message pushed in place of whatever `f` left, and the
/// error is returned.
pub fn run_protected<R>(
    g: &mut GlobalState,
    th: ThreadId,
    f: impl FnOnce(&mut GlobalState) -> LuaResult<R>,
) -> LuaResult<R> {
    let marker = ProtectMarker::save(g, th);
    g.thread_mut(th).protect.push(marker);
    let depth = g.thread(th).protect.len();
    let result = f(g);
    let thread = g.thread_mut(th);
    debug_assert_eq!(thread.protect.len(), depth, "unbalanced protected calls");
    thread.protect.pop();
    match result {
        Ok(value) => {
            g.thread_mut(th).errfunc = marker.old_errfunc;
            Ok(value)
        }
        Err(err) => {
            unwind_to(g, th, &marker, &err);
            Err(err)
        }
    }
}

/// Depth of nested protected calls of a thread.
pub fn protect_depth(g: &GlobalState, th: ThreadId) -> usize {
    g.thread(th).protect.len()
}

/// Value describing `err`, for the stack of the thread that caught it.
fn error_object(g: &mut GlobalState, err: &LuaError) -> TValue {
    let fallback = match g.memerrmsg {
        Some(msg) => TValue::ShortString(msg),
        None => TValue::Nil,
    };
    match err {
        LuaError::OutOfMemory => fallback,
        other => match string::new_str(g, &other.to_string()) {
            Ok(msg) => string::value(g, msg),
            // no memory left for the message itself
            Err(_) => fallback,
        },
    }
}

/// Puts thread `th` back in the state recorded by `marker`: upvalues above the saved top
/// are closed, the error message goes to the saved top, and the frame list and stack are
/// shrunk.
pub fn unwind_to(g: &mut GlobalState, th: ThreadId, marker: &ProtectMarker, err: &LuaError) {
    log::debug!(target: "control", "unwinding {:?} to top {}: {}", th, marker.old_top, err);
    fun::close_upvalues(g, th, marker.old_top);
    let msg = error_object(g, err);
    let max_stack = g.max_stack;
    let (thread, mem) = g.split(th);
    thread.stack[marker.old_top] = msg;
    thread.top = marker.old_top + 1;
    thread.ci = marker.old_ci;
    thread.allowhook = marker.old_allowhook;
    thread.nny = marker.old_nny;
    thread.errfunc = marker.old_errfunc;
    thread.shrink_stack(mem, max_stack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::State;

    #[test]
    fn success_keeps_the_stack() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let value = run_protected(g, ThreadId::Main, |g| {
            g.push(ThreadId::Main, TValue::Int(5))?;
            Ok(12)
        })
        .unwrap();
        assert_eq!(value, 12);
        assert_eq!(g.mainthread.stack().last(), Some(&TValue::Int(5)));
        assert_eq!(protect_depth(g, ThreadId::Main), 0);
    }

    #[test]
    fn failure_restores_the_thread() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let top = g.mainthread.top();
        let ci = g.mainthread.ci;
        let err = run_protected(g, ThreadId::Main, |g| -> LuaResult<()> {
            for i in 0..100 {
                g.push(ThreadId::Main, TValue::Int(i))?;
            }
            let (th, mem) = g.split(ThreadId::Main);
            th.next_ci(mem)?;
            fun::find_upval(g, ThreadId::Main, top + 3)?;
            Err(LuaError::runtime("boom"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        let main = &g.mainthread;
        assert_eq!(main.top(), top + 1);
        assert_eq!(main.ci, ci);
        assert!(main.openupval.is_none());
        let msg = main.stack()[top].string();
        assert_eq!(g.heap.string(msg).as_bytes(), b"boom");
        assert!(main.stack_size() < 100);
    }

    #[test]
    fn memory_errors_use_the_preallocated_message() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let top = g.mainthread.top();
        let err = run_protected(g, ThreadId::Main, |_| -> LuaResult<()> {
            Err(LuaError::OutOfMemory)
        })
        .unwrap_err();
        assert!(matches!(err, LuaError::OutOfMemory));
        assert_eq!(
            g.mainthread.stack()[top],
            TValue::ShortString(g.memerrmsg().unwrap())
        );
    }
}
