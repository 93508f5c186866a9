use crate::{
    gc,
    runtime::{error::LuaResult, state::GlobalState, string},
};

pub const RESERVED: [&str; 22] = [
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Interns the reserved words, fixed, each tagged with its 1-based index.
pub fn init(g: &mut GlobalState) -> LuaResult<()> {
    for (i, word) in RESERVED.iter().enumerate() {
        let s = string::new_str(g, word)?;
        gc::fix(g, s);
        g.heap.string_mut(s).extra = i as u8 + 1;
    }
    Ok(())
}

/// Reserved-word index of `word`, if it is one.
pub fn reserved_index(word: &[u8]) -> Option<usize> {
    RESERVED
        .iter()
        .position(|w| w.as_bytes() == word)
        .map(|i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcList;
    use crate::runtime::state::State;

    #[test]
    fn reserved_words_are_fixed_and_tagged() {
        let mut state = State::new().unwrap();
        let g = &mut *state;
        let w = string::new_str(g, "while").unwrap();
        assert_eq!(g.heap.string(w).reserved(), 22);
        assert_eq!(g.heap.header(w).list(), GcList::FixedGc);
        let name = string::new_str(g, "whilst").unwrap();
        assert_eq!(g.heap.string(name).reserved(), 0);
        assert_eq!(reserved_index(b"and"), Some(1));
        assert_eq!(reserved_index(b"print"), None);
    }
}
