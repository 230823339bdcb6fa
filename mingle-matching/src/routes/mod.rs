pub mod health;
pub mod session;
pub mod sse;
