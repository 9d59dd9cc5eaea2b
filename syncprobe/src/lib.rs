pub mod browser;
pub mod callback_server;
pub mod probe;
pub mod run;
pub mod tunnel;
