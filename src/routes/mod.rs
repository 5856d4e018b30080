pub mod subscription_routes;
pub mod system_routes;
pub mod tunnel_routes;
