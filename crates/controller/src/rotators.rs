use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

/// AWS web-identity exchange
pub mod aws;

/// Annotation on rotator-managed secrets recording the credential expiry.
pub const EXPIRATION_TIME_ANNOTATION: &str = "rotators/expiration-time";

/// Lead time before a known expiry at which rotation fires.
pub const PRE_ROTATION_WINDOW_SECS: i64 = 300;

/// Name of the managed secret holding a policy's rotated credentials.
pub fn bsp_secret_name(policy_name: &str) -> String {
    format!("ai-eg-bsp-{policy_name}")
}

/// True once the pre-rotation instant has passed; an absent instant means
/// the credential was never rotated and is due immediately.
pub fn pre_rotation_time_elapsed(pre_rotation_time: Option<DateTime<Utc>>) -> bool {
    pre_rotation_time.is_none_or(|t| t <= Utc::now())
}

/// Rotates a credential secret ahead of its recorded expiry.
#[async_trait]
pub trait Rotator: Send + Sync {
    /// The managed secret's recorded expiry minus the pre-rotation window;
    /// `None` when the secret (or its expiry annotation) does not exist yet.
    async fn get_pre_rotation_time(&self) -> Result<Option<DateTime<Utc>>>;

    fn is_expired(&self, pre_rotation_time: Option<DateTime<Utc>>) -> bool {
        pre_rotation_time_elapsed(pre_rotation_time)
    }

    /// Exchanges the access token for fresh credentials and rewrites the
    /// managed secret. Returns the new expiry.
    async fn rotate(&self, access_token: &str) -> Result<DateTime<Utc>>;
}
