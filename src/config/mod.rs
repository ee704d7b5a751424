//! Input configuration model: the `repositories` object, per-repository
//! pragmas and checkout types, and the schema-checking field reader used
//! by all description parsers.

pub mod field_reader;
pub mod pragmas;
pub mod repos;
