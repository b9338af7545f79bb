pub mod parsing;
pub mod time;
