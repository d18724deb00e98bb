pub mod error;
pub mod fitting;
pub mod model;
pub mod trading;
pub mod travel;

pub use error::*;
pub use fitting::*;
pub use model::*;
pub use trading::*;
pub use travel::*;
