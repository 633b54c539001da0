// murmur-common: shared wire types for the Murmur chat relay

pub mod protocol;
pub mod types;
