pub mod parser;
pub mod render;
pub mod task_types;

pub use parser::*;
pub use render::*;
pub use task_types::*;
