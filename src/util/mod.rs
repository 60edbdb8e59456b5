pub mod safe_converter;
pub mod address;
