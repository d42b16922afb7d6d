pub mod calc;
pub mod commands;
pub mod connection;
pub mod modbus;
pub mod output;
pub mod poller;
pub mod power_map;
pub mod registers;
