pub mod result;
pub mod testcase;

pub use result::*;
pub use testcase::*;
