pub mod position;
pub mod zones;
