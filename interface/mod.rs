pub mod data;
pub mod flat;
pub mod model;
