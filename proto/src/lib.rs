pub mod conn;
pub mod frame;
pub mod packet;
pub mod tls;
