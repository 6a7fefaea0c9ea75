/// Randomized delay drawn uniformly from a closed interval.
pub mod uniform;
