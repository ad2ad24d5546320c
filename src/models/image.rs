use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Output formats the converter can encode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ImageFormat {
    #[strum(to_string = "jpeg", serialize = "jpg")]
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

/// Metadata row for one physical file in the blob store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    pub format: ImageFormat,
    pub storage_key: String,
}

impl Image {
    /// Blob store key for an image id.
    pub fn storage_key_for(id: Uuid) -> String {
        id.to_string()
    }
}
