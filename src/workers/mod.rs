//! The three stage workers: analyzer (batched), CRF-searcher and encoder
//! (one Video at a time each). Each owns at most one process-runner at a
//! time, consumes parser events, updates the store, and emits broadcasts.

pub mod analyzer;
pub mod crf_search;
pub mod encoder;
