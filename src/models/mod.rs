pub mod change;
pub mod document;
pub mod load;
pub mod route;
