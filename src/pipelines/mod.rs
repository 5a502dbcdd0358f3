pub mod checkpoint;
pub mod engine;
pub mod graph;
pub mod merge;
pub mod preprocess;
pub mod provenance;
pub mod sample;
