pub mod app;
pub mod subscription;
pub mod tunnel;
