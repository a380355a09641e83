pub mod broker;
pub mod database;
pub mod memory;
pub mod rbmq;
pub mod redis;
pub mod smtp;
