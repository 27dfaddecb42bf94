pub mod config;
pub mod logging;
pub mod operator;
pub mod run;
pub mod sync;
