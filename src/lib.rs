pub mod bytecode;
pub mod config;
pub mod lang;
pub mod runtime;
