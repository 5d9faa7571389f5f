//! Intermediate Language (IL).
//!
//! Tree-shaped, lexically resolved form of a program. Syntax is lowered to IL by [`convert`],
//! which is then converted to CPS.

pub mod assignment_elimination;
pub mod convert;
pub mod pretty;
pub mod term;

pub use assignment_elimination::assignment_elimination;
pub use convert::convert;
