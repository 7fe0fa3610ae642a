pub mod codegen;
pub mod compiler;
pub mod logger;
pub mod tac;
pub mod values;
