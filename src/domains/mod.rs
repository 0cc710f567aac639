pub mod assistant;
pub mod git;
pub mod sessions;
