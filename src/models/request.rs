use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::image::ImageFormat;

/// Lifecycle of a conversion request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Failed,
    Done,
}

impl RequestStatus {
    /// Forward-only state machine. `Failed -> Processing` is only taken when the
    /// queue redelivers the message; `Done` is terminal.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Done)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Failed, Failed)
        )
    }

    /// Statuses a row may currently hold for a move to `next` to be accepted.
    pub fn allowed_predecessors(next: RequestStatus) -> Vec<RequestStatus> {
        [
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Failed,
            RequestStatus::Done,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(next))
        .collect()
    }

    pub fn is_terminal(self) -> bool {
        self == RequestStatus::Done
    }
}

/// One user's conversion job, from submission to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_image_id: Uuid,
    pub target_image_id: Option<Uuid>,
    pub source_format: ImageFormat,
    pub target_format: ImageFormat,
    pub ratio: i32,
    pub status: RequestStatus,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values needed to create a request row in the `queued` state.
#[derive(Debug, Clone)]
pub struct NewConversionRequest {
    pub user_id: Uuid,
    pub source_image_id: Uuid,
    pub source_format: ImageFormat,
    pub target_format: ImageFormat,
    pub ratio: i32,
}

/// Submission parameters accepted at the API boundary.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConversionForm {
    #[garde(length(min = 1, max = 255), custom(plain_filename))]
    pub filename: String,

    #[garde(skip)]
    pub source_format: ImageFormat,

    #[garde(skip)]
    pub target_format: ImageFormat,

    #[garde(range(min = 1, max = 100))]
    pub ratio: i32,
}

fn plain_filename(value: &str, _ctx: &()) -> garde::Result {
    if value.contains(['/', '\\']) || value.chars().any(char::is_control) {
        return Err(garde::Error::new("filename must not contain path separators or control characters"));
    }
    Ok(())
}
