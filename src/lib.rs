#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod buffer;
pub mod data;
pub mod decompose;
pub mod eval;
pub mod losses;
pub mod model;
pub mod router;
pub mod trainer;
