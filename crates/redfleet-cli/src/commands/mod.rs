pub mod create;
pub mod instance;
