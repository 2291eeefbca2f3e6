pub mod password;
pub mod similarity;
pub mod token;

pub use password::*;
pub use similarity::*;
pub use token::*;
