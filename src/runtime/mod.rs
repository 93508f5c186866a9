pub mod cmp;
pub mod control;
pub mod dump;
pub mod error;
pub mod fun;
pub mod keywords;
pub mod listing;
pub mod ltype;
pub mod object;
pub mod state;
pub mod string;
pub mod table;
pub mod tm;
pub mod undump;
pub mod value;
