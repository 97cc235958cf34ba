pub mod aggregate;
pub mod grid;
pub mod location;
pub mod mesh;
pub mod outcome;
