pub mod error;
pub mod loader;
pub mod model;
pub mod options;
pub mod output;
pub mod solver;
pub mod sparse;
pub mod stats;
pub mod system;
pub mod twolevel;
