pub mod notification_service;
pub mod notifier;
pub mod subscription_mgr;
