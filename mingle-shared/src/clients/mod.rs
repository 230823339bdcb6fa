pub mod db;
pub mod push;
pub mod rabbitmq;
