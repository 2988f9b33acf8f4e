pub mod assign;
pub mod classify;
pub mod status;
