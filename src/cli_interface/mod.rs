mod cli_struct;

pub use cli_struct::*;
