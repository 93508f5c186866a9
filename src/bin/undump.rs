use std::{fs::File, io::BufWriter};

use lunar::{
    runtime::{dump::dump, listing::list, state::State, undump::load, value::ThreadId},
    vm::options::UndumpOptions,
};

fn main() {
    env_logger::init();

    let opts = match UndumpOptions::parse() {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    let bytes = match std::fs::read(&opts.filename) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error: cannot read {}: {}", opts.filename.display(), err);
            std::process::exit(1);
        }
    };

    let mut state = match State::with_options(&opts.state) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("Error: cannot open state: {}", err);
            std::process::exit(1);
        }
    };

    let chunkname = format!("@{}", opts.filename.display());
    let cl = match load(&mut state, ThreadId::Main, &mut &bytes[..], &chunkname) {
        Ok(cl) => cl,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };
    let Some(proto) = state.objects().lclosure(cl).proto() else {
        eprintln!("Error: loaded closure has no prototype");
        std::process::exit(1);
    };

    if !opts.quiet {
        let mut out = String::new();
        if list(&state, proto, true, &mut out).is_ok() {
            print!("{}", out);
        }
    }

    let mem = state.memory();
    println!();
    println!("bytes in use: {}", mem.total_bytes());
    println!("debt:         {}", mem.debt());
    if let Some(live) = mem.allocator_in_use() {
        println!("allocator:    {}", live);
    }
    println!("objects:      {}", state.objects().len());

    if let Some(path) = &opts.strip_out {
        let file = match File::create(path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("Error: cannot create {}: {}", path.display(), err);
                std::process::exit(1);
            }
        };
        let mut w = BufWriter::new(file);
        if let Err(err) = dump(&state, proto, &mut w, true) {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
        log::info!("stripped chunk written to {}", path.display());
    }
}
