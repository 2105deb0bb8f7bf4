pub mod twilio;

use async_trait::async_trait;

/// Post-booking notification boundary. Fire-and-forget: failures are
/// logged by the caller and never unwind a committed booking.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    async fn notify(&self, to: &str, body: &str) -> anyhow::Result<()>;
}
