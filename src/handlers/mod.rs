pub mod admin_handlers;
pub mod health_handlers;
pub mod share_handlers;
pub mod tracking_handlers;
pub mod transfer_handlers;
pub mod upload_handlers;
