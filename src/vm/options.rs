use std::path::PathBuf;

use once_cell::sync::Lazy;

use crate::{
    runtime::state::{LUAI_GCMUL, LUAI_GCPAUSE, LUAI_MAXSTACK},
    utils::env::{read_uint_from_env, read_uint_from_str},
};

/// Settings a state is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateOptions {
    /// Fixed hash seed; a fresh one is made per state when absent.
    pub seed: Option<u32>,
    /// Upper bound on the bytes the state may hold.
    pub memory_limit: Option<usize>,
    pub gc_pause: u32,
    pub gc_stepmul: u32,
    /// Largest stack a thread may grow to, in slots.
    pub max_stack: usize,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            seed: None,
            memory_limit: None,
            gc_pause: LUAI_GCPAUSE,
            gc_stepmul: LUAI_GCMUL,
            max_stack: LUAI_MAXSTACK,
        }
    }
}

impl StateOptions {
    /// Defaults overridden by the `LUNAR_*` variables of the environment. Sizes accept the
    /// `k`, `m` and `g` suffixes.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        options.memory_limit = read_uint_from_env("LUNAR_MEMORY_LIMIT");
        if let Some(pause) = read_uint_from_env("LUNAR_GC_PAUSE") {
            options.gc_pause = pause.min(u32::MAX as usize) as u32;
        }
        if let Some(stepmul) = read_uint_from_env("LUNAR_GC_STEPMUL") {
            options.gc_stepmul = stepmul.min(u32::MAX as usize) as u32;
        }
        if let Some(max_stack) = read_uint_from_env("LUNAR_MAX_STACK") {
            if max_stack >= crate::runtime::state::BASIC_STACK_SIZE {
                options.max_stack = max_stack;
            } else {
                log::warn!(target: "options", "LUNAR_MAX_STACK={} is too small, ignored", max_stack);
            }
        }
        options.seed = std::env::var("LUNAR_SEED")
            .ok()
            .and_then(|seed| seed.trim().parse::<u32>().ok());
        log::trace!(target: "options", "{:?}", options);
        options
    }

    pub fn set_memory_limit(&mut self, limit: usize) {
        self.memory_limit = Some(limit);
    }

    pub fn set_seed(&mut self, seed: u32) {
        self.seed = Some(seed);
    }
}

/// Options read once from the environment, used by [`crate::runtime::state::State::new`].
pub static OPTIONS: Lazy<StateOptions> = Lazy::new(StateOptions::from_env);

/// Command line of `lunar-undump`.
pub struct UndumpOptions {
    pub state: StateOptions,
    pub filename: PathBuf,
    pub strip_out: Option<PathBuf>,
    pub quiet: bool,
}

impl UndumpOptions {
    pub fn parse() -> Result<Self, String> {
        parse(pico_args::Arguments::from_env())
    }
}

pub fn parse(mut args: pico_args::Arguments) -> Result<UndumpOptions, String> {
    if args.contains(["-h", "--help"]) {
        println!("Usage: lunar-undump [options] <chunk file>");
        println!("Options:");
        println!("  -h, --help: Print this help message");
        println!("  --strip-out <file>: Write the chunk again without debug information");
        println!("  --memory-limit <size>: Fail once the state holds more than <size> bytes (e.g. 64m)");
        println!("  -q, --quiet: Do not print the listing");
        std::process::exit(0);
    }

    let mut state = OPTIONS.clone();
    match args.opt_value_from_str::<_, String>("--memory-limit") {
        Ok(Some(size)) => match read_uint_from_str(&size) {
            Some(limit) => state.set_memory_limit(limit),
            None => return Err(format!("invalid memory limit '{}'", size)),
        },
        Ok(None) => (),
        Err(e) => return Err(e.to_string()),
    }

    let strip_out = match args.opt_value_from_str::<_, PathBuf>("--strip-out") {
        Ok(path) => path,
        Err(e) => return Err(e.to_string()),
    };

    let quiet = args.contains(["-q", "--quiet"]);

    let filename = match args.free_from_str::<PathBuf>() {
        Ok(filename) => filename,
        Err(e) => return Err(e.to_string()),
    };

    let rest = args.finish();
    if !rest.is_empty() {
        return Err(format!("unexpected arguments: {:?}", rest));
    }

    Ok(UndumpOptions {
        state,
        filename,
        strip_out,
        quiet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn args(list: &[&str]) -> pico_args::Arguments {
        pico_args::Arguments::from_vec(list.iter().map(OsString::from).collect())
    }

    #[test]
    fn command_line() {
        let options = parse(args(&["--memory-limit", "2m", "--strip-out", "out.luac", "in.luac"])).unwrap();
        assert_eq!(options.filename, PathBuf::from("in.luac"));
        assert_eq!(options.strip_out, Some(PathBuf::from("out.luac")));
        assert_eq!(options.state.memory_limit, Some(2 * 1024 * 1024));
        assert!(!options.quiet);

        let options = parse(args(&["-q", "in.luac"])).unwrap();
        assert!(options.quiet);
        assert_eq!(options.strip_out, None);
    }

    #[test]
    fn bad_command_lines() {
        assert!(parse(args(&[])).is_err());
        assert!(parse(args(&["--memory-limit", "plenty", "in.luac"])).is_err());
        assert!(parse(args(&["in.luac", "extra"])).is_err());
    }

    #[test]
    fn defaults() {
        let options = StateOptions::default();
        assert_eq!(options.gc_pause, LUAI_GCPAUSE);
        assert_eq!(options.max_stack, LUAI_MAXSTACK);
        assert!(options.seed.is_none());
    }
}
