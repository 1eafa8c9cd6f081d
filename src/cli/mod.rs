pub mod app;
pub mod commands;
pub mod dispatch;
pub mod doctor;
pub mod env;
pub mod list;
pub mod run;
pub mod runtime;
