pub mod caddy;
pub mod catalog;
pub mod config_loader;
pub mod containers;
pub mod deploy;
pub mod dispatch;
pub mod exec_pool;
pub mod health;
pub mod history;
pub mod path_guard;
pub mod ports;
pub mod promote;
pub mod query;
pub mod quadlet;
pub mod rollback;
pub mod slot_store;
pub mod state;
pub mod transport;
