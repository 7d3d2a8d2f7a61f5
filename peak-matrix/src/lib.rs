pub mod binarize;
pub mod hits;
pub mod padded;
pub mod simplex;
