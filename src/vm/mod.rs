pub mod lock;
pub mod options;
