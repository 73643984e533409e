pub mod ast;
pub mod build;
pub mod value;
