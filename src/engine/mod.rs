pub mod alerts;
pub mod lifecycle;
pub mod projection;
pub mod reconciler;
pub mod session;
